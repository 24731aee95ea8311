//! FFI round-trip tests: bytecode calling native code and native code
//! calling bytecode through generated closures.

#![cfg(all(unix, target_arch = "x86_64"))]

use std::ffi::c_void;

use kiln_engine::{Atom, Compiler, Module, State};

fn host_module(src: &str) -> (std::sync::Arc<State>, Module) {
    let state = State::new();
    let compiler = Compiler::host(&state);
    compiler.add_library_alias("c", "libc.so.6");
    let mut module = Module::new(&compiler);
    module.compile_string_ir(src).unwrap();
    (state, module)
}

#[test]
fn test_closure_called_from_native_code() {
    // A native caller invokes a bytecode procedure 10 times; the side
    // effect increments a module-level counter.
    let (_state, module) = host_module(
        r#"
data counter :u64
pub proc bump() :void {
    mov :u64 $counter -> :u64 %c
    add :u64 %c, :u64 1 -> :u64 %c
    mov :u64 %c -> :u64 $counter
    ret
}
"#,
    );

    let entry = module.get_symbol_address(Atom::intern("bump")).unwrap();
    let bump: extern "C" fn() = unsafe { std::mem::transmute(entry) };
    for _ in 0..10 {
        bump();
    }

    let counter = module.get_symbol_address(Atom::intern("counter")).unwrap();
    let value = unsafe { (counter as *const u64).read() };
    assert_eq!(value, 10);
}

#[test]
fn test_closure_with_arguments_and_return() {
    let (_state, module) = host_module(
        r#"
pub proc mix(:i64 %a, :f64 %b) :f64 {
    i2fp :i64 %a -> :f64 %fa
    add :f64 %fa, :f64 %b -> :f64 ret
    ret
}
"#,
    );

    let entry = module.get_symbol_address(Atom::intern("mix")).unwrap();
    let mix: extern "C" fn(i64, f64) -> f64 = unsafe { std::mem::transmute(entry) };
    assert_eq!(mix(4, 0.5), 4.5);
    assert_eq!(mix(-1, 0.25), -0.75);
}

#[test]
fn test_jit_is_idempotent() {
    let (_state, module) = host_module(
        r#"
pub proc id(:i64 %x) :i64 {
    mov :i64 %x -> :i64 ret
    ret
}
"#,
    );

    let first = module.get_symbol_address(Atom::intern("id")).unwrap();
    let second = module.get_symbol_address(Atom::intern("id")).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_extern_snprintf_formats_into_module_data() {
    let (_state, module) = host_module(
        r#"
extern "c" proc snprintf(:*i8, :u64, :*i8, ...) :i32
const fmt :{[20]i8} = {"%lli + %lli = %lli\n"}
data buf :{[64]i8}

pub proc run() :i32 %r {
    lea :{[64]i8} $buf -> :*i8 %p
    lea :{[20]i8} $fmt -> :*i8 %f
    call :(*i8, u64, *i8, ...) i32 $snprintf, (:*i8 %p, :u64 64, :*i8 %f, :i64 4, :i64 5, :i64 9) -> :i32 %r
    ret
}
"#,
    );

    let mut ret = 0i32;
    module
        .invoke(
            Atom::intern("run"),
            &[],
            &mut ret as *mut i32 as *mut c_void,
        )
        .unwrap();
    assert_eq!(ret, 10);

    let buf = module.get_symbol_address(Atom::intern("buf")).unwrap();
    let text = unsafe { std::ffi::CStr::from_ptr(buf as *const i8) };
    assert_eq!(text.to_str().unwrap(), "4 + 5 = 9\n");
}

#[test]
fn test_extern_printf_returns_length() {
    let (_state, module) = host_module(
        r#"
extern "c" proc printf(:*i8, ...) :i32
const fmt :{[20]i8} = {"%lli + %lli = %lli\n"}

pub proc run() :i32 %r {
    lea :{[20]i8} $fmt -> :*i8 %f
    call :(*i8, ...) i32 $printf, (:*i8 %f, :i64 4, :i64 5, :i64 9) -> :i32 %r
    ret
}
"#,
    );

    let mut ret = 0i32;
    module
        .invoke(
            Atom::intern("run"),
            &[],
            &mut ret as *mut i32 as *mut c_void,
        )
        .unwrap();
    // printf returns the number of bytes written: "4 + 5 = 9\n".
    assert_eq!(ret, 10);
}

#[test]
fn test_indirect_call_through_procedure_value() {
    // A bytecode procedure is stored as a value and called indirectly;
    // the call goes through its native entry point.
    let (_state, module) = host_module(
        r#"
proc double(:i64 %x) :i64 {
    add :i64 %x, :i64 %x -> :i64 ret
    ret
}

pub proc apply(:i64 %x) :i64 {
    mov :(i64) i64 $double -> :(i64) i64 %f
    call :(i64) i64 %f, (:i64 %x) -> :i64 ret
    ret
}
"#,
    );

    let mut x = 21i64;
    let mut ret = 0i64;
    let argv = [&mut x as *mut i64 as *mut c_void];
    module
        .invoke(
            Atom::intern("apply"),
            &argv,
            &mut ret as *mut i64 as *mut c_void,
        )
        .unwrap();
    assert_eq!(ret, 42);
}

#[test]
fn test_host_provided_extern_symbol() {
    extern "C" fn triple(x: i64) -> i64 {
        x * 3
    }

    let (_state, module) = host_module(
        r#"
extern proc triple(:i64) :i64

pub proc run(:i64 %x) :i64 {
    call :(i64) i64 $triple, (:i64 %x) -> :i64 ret
    ret
}
"#,
    );
    module.define_extern_symbols(&[(Atom::intern("triple"), triple as *mut c_void)]);

    let mut x = 14i64;
    let mut ret = 0i64;
    let argv = [&mut x as *mut i64 as *mut c_void];
    module
        .invoke(
            Atom::intern("run"),
            &argv,
            &mut ret as *mut i64 as *mut c_void,
        )
        .unwrap();
    assert_eq!(ret, 42);
}

#[test]
fn test_symbol_resolver_callback() {
    extern "C" fn seven() -> i64 {
        7
    }

    let (_state, module) = host_module(
        r#"
extern proc seven() :i64

pub proc run() :i64 {
    call :() i64 $seven, () -> :i64 ret
    ret
}
"#,
    );
    module
        .set_symbol_resolver(Box::new(|sym| {
            (sym.as_str() == "seven").then(|| seven as *mut c_void)
        }))
        .unwrap();

    let mut ret = 0i64;
    module
        .invoke(Atom::intern("run"), &[], &mut ret as *mut i64 as *mut c_void)
        .unwrap();
    assert_eq!(ret, 7);
}
