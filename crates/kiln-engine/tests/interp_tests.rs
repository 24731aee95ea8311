//! End-to-end interpreter tests: compile IR (textual or built through the
//! factory API) and execute it in process.

use std::ffi::c_void;

use kiln_engine::ir::{self, Label, Param, Proc, Symbol, Visibility};
use kiln_engine::{Atom, Compiler, Module, NumericType, State};

fn host_module() -> (std::sync::Arc<State>, Module) {
    let state = State::new();
    let compiler = Compiler::host(&state);
    let module = Module::new(&compiler);
    (state, module)
}

fn invoke_i64(module: &Module, name: &str, args: &[i64]) -> i64 {
    let mut args: Vec<i64> = args.to_vec();
    let argv: Vec<*mut c_void> = args
        .iter_mut()
        .map(|a| a as *mut i64 as *mut c_void)
        .collect();
    let mut ret = 0i64;
    module
        .invoke(Atom::intern(name), &argv, &mut ret as *mut i64 as *mut c_void)
        .unwrap();
    ret
}

#[test]
fn test_add_two_integers() {
    let (_state, mut module) = host_module();
    module
        .compile_string_ir(
            r#"
pub proc plus(:i64 %a, :i64 %b) :i64 {
    add :i64 %a, :i64 %b -> :i64 ret
    ret
}
"#,
        )
        .unwrap();

    assert_eq!(invoke_i64(&module, "plus", &[4, 5]), 9);
    assert_eq!(invoke_i64(&module, "plus", &[-10, 3]), -7);
}

#[test]
fn test_branching_not() {
    // Built through the factory API: returns 0 if x != 0 else 1.
    let (state, mut module) = host_module();
    let i64_t = state.types.get_numeric(NumericType::Int64);

    let x = ir::make_ref_param("x", i64_t.clone());
    let ret = ir::make_ref_ret(i64_t.clone());
    let zero = ir::make_ref_imm(ir::Imm::from_i64(0), i64_t.clone());
    let one = ir::make_ref_imm(ir::Imm::from_i64(1), i64_t.clone());

    let is_zero = Atom::intern("is_zero");
    module.define_symbol(
        Symbol::proc(
            "not",
            Proc {
                params: vec![Param {
                    name: Atom::intern("x"),
                    ty: i64_t.clone(),
                }],
                ret: Param {
                    name: Atom::NONE,
                    ty: i64_t.clone(),
                },
                instrs: vec![
                    ir::make_jmpz(x, Label::Abs(is_zero)),
                    ir::make_mov(ret.clone(), zero),
                    ir::make_ret(),
                    ir::make_label(is_zero),
                    ir::make_mov(ret, one),
                    ir::make_ret(),
                ],
                variadic: false,
            },
        )
        .with_vis(Visibility::Default),
    );
    module.validate().unwrap();

    for (input, expected) in [(0, 1), (1, 0), (42, 0), (-1, 0)] {
        assert_eq!(invoke_i64(&module, "not", &[input]), expected);
    }
}

const MACHIN_IR: &str = r#"
proc atan_inv(:f64 %x) :f64 %r {
    mov :f64 1.0 -> :f64 %sign
    mov :f64 %x -> :f64 %xpow
    mov :f64 0.0 -> :f64 %acc
    mov :i64 0 -> :i64 %k
@loop:
    cmp_ge :i64 %k, :i64 10 -> :u8 %done
    jmpnz :u8 %done, @end
    mul :i64 %k, :i64 2 -> :i64 %twok
    add :i64 %twok, :i64 1 -> :i64 %den_i
    i2fp :i64 %den_i -> :f64 %den_f
    mul :f64 %den_f, :f64 %xpow -> :f64 %den
    div :f64 %sign, :f64 %den -> :f64 %term
    add :f64 %acc, :f64 %term -> :f64 %acc
    mul :f64 %x, :f64 %x -> :f64 %xx
    mul :f64 %xpow, :f64 %xx -> :f64 %xpow
    neg :f64 %sign -> :f64 %sign
    add :i64 %k, :i64 1 -> :i64 %k
    jmp @loop
@end:
    mov :f64 %acc -> :f64 %r
    ret
}

pub proc machin() :f64 %r {
    call :(f64) f64 $atan_inv, (:f64 5.0) -> :f64 %a5
    call :(f64) f64 $atan_inv, (:f64 239.0) -> :f64 %a239
    mul :f64 %a5, :f64 16.0 -> :f64 %t1
    mul :f64 %a239, :f64 4.0 -> :f64 %t2
    sub :f64 %t1, :f64 %t2 -> :f64 %r
    ret
}
"#;

#[test]
fn test_machin_pi_approximation() {
    let (_state, mut module) = host_module();
    module.compile_string_ir(MACHIN_IR).unwrap();

    let mut pi = 0.0f64;
    module
        .invoke(
            Atom::intern("machin"),
            &[],
            &mut pi as *mut f64 as *mut c_void,
        )
        .unwrap();
    assert!(
        (pi - std::f64::consts::PI).abs() < 1e-14,
        "got {:.17}",
        pi
    );
}

#[test]
fn test_pointer_aggregate_roundtrip() {
    let (_state, mut module) = host_module();
    module
        .compile_string_ir(
            r#"
pub proc vec2_len_squared(:*{[2]f64} %v, :*f64 %r) :void {
    mov :f64 [%v] -> :f64 %x
    mov :f64 [%v]+8 -> :f64 %y
    mul :f64 %x, :f64 %x -> :f64 %xx
    mul :f64 %y, :f64 %y -> :f64 %yy
    add :f64 %xx, :f64 %yy -> :f64 %sum
    store :f64 %sum -> :*f64 %r
    ret
}
"#,
        )
        .unwrap();

    let mut v = [4.0f64, 5.0f64];
    let mut out = 0.0f64;
    let mut vp = v.as_mut_ptr();
    let mut rp = &mut out as *mut f64;
    let argv = [
        &mut vp as *mut *mut f64 as *mut c_void,
        &mut rp as *mut *mut f64 as *mut c_void,
    ];
    module
        .invoke(Atom::intern("vec2_len_squared"), &argv, std::ptr::null_mut())
        .unwrap();
    assert_eq!(out, 41.0);
}

#[test]
fn test_alloc_load_store() {
    let (_state, mut module) = host_module();
    module
        .compile_string_ir(
            r#"
pub proc scratch(:i64 %x) :i64 {
    alloc :i64 -> :*i64 %p
    store :i64 %x -> :*i64 %p
    load :*i64 %p -> :i64 %y
    add :i64 %y, :i64 %y -> :i64 ret
    ret
}
"#,
        )
        .unwrap();

    assert_eq!(invoke_i64(&module, "scratch", &[21]), 42);
}

#[test]
fn test_division_by_zero_is_an_error() {
    let (state, mut module) = host_module();
    module
        .compile_string_ir(
            r#"
pub proc crash(:i64 %x) :i64 {
    div :i64 %x, :i64 0 -> :i64 ret
    ret
}
"#,
        )
        .unwrap();

    let mut x = 1i64;
    let mut ret = 0i64;
    let argv = [&mut x as *mut i64 as *mut c_void];
    let err = module
        .invoke(
            Atom::intern("crash"),
            &argv,
            &mut ret as *mut i64 as *mut c_void,
        )
        .unwrap_err();
    assert!(matches!(err, kiln_engine::Error::Runtime(_)));
    assert!(!state.diagnostics().is_empty());

    // The interpreter unwound; a following invocation works normally.
    module
        .compile_string_ir(
            "pub proc ok() :i64 {\n    mov :i64 7 -> :i64 ret\n    ret\n}\n",
        )
        .unwrap();
    assert_eq!(invoke_i64(&module, "ok", &[]), 7);
}

#[test]
fn test_runaway_recursion_overflows_cleanly() {
    let (_state, mut module) = host_module();
    module
        .compile_string_ir(
            r#"
proc down() :i64 {
    alloc :{[4096]i8} -> :*i8 %p
    call :() i64 $down, () -> :i64 ret
    ret
}

pub proc go() :i64 {
    call :() i64 $down, () -> :i64 ret
    ret
}
"#,
        )
        .unwrap();

    let mut ret = 0i64;
    let err = module
        .invoke(Atom::intern("go"), &[], &mut ret as *mut i64 as *mut c_void)
        .unwrap_err();
    assert!(matches!(err, kiln_engine::Error::Runtime(_)));
}

#[cfg(target_os = "linux")]
#[test]
fn test_syscall_getpid() {
    let (_state, mut module) = host_module();
    module
        .compile_string_ir(
            r#"
pub proc mypid() :i64 {
    syscall :i64 39, () -> :i64 ret
    ret
}
"#,
        )
        .unwrap();

    assert_eq!(invoke_i64(&module, "mypid", &[]), std::process::id() as i64);
}

#[test]
fn test_concurrent_invocations_share_one_module() {
    let (_state, mut module) = host_module();
    module
        .compile_string_ir(
            r#"
pub proc square(:i64 %x) :i64 {
    mul :i64 %x, :i64 %x -> :i64 ret
    ret
}
"#,
        )
        .unwrap();

    // Warm the translation cache, then hammer it from several threads;
    // each thread owns its interpreter stack.
    assert_eq!(invoke_i64(&module, "square", &[3]), 9);
    std::thread::scope(|scope| {
        for t in 0..4i64 {
            let module = &module;
            scope.spawn(move || {
                for i in 0..200 {
                    let x = t * 1000 + i;
                    assert_eq!(invoke_i64(module, "square", &[x]), x * x);
                }
            });
        }
    });
}

#[test]
fn test_mutual_recursion() {
    let (_state, mut module) = host_module();
    module
        .compile_string_ir(
            r#"
proc is_even(:i64 %n) :i64 {
    jmpnz :i64 %n, @recurse
    mov :i64 1 -> :i64 ret
    ret
@recurse:
    sub :i64 %n, :i64 1 -> :i64 %m
    call :(i64) i64 $is_odd, (:i64 %m) -> :i64 ret
    ret
}

proc is_odd(:i64 %n) :i64 {
    jmpnz :i64 %n, @recurse
    mov :i64 0 -> :i64 ret
    ret
@recurse:
    sub :i64 %n, :i64 1 -> :i64 %m
    call :(i64) i64 $is_even, (:i64 %m) -> :i64 ret
    ret
}

pub proc check(:i64 %n) :i64 {
    call :(i64) i64 $is_even, (:i64 %n) -> :i64 ret
    ret
}
"#,
        )
        .unwrap();

    assert_eq!(invoke_i64(&module, "check", &[10]), 1);
    assert_eq!(invoke_i64(&module, "check", &[7]), 0);
}
