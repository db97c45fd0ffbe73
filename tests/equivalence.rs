#![cfg(all(target_arch = "x86_64", unix))]

//! Native and interpreted execution agree, including when a run switches
//! between the two at fallbacks and entry points.

mod common;

use common::*;
use scriptjit::vm::{
    Behaviours, CallConvention, ObjectType, Opcode, ParamShape, ReturnShape, SystemFunction,
};

fn host(address: usize, convention: CallConvention, params: Vec<ParamShape>, returns: ReturnShape) -> SystemFunction {
    SystemFunction {
        address,
        convention,
        params,
        returns,
        bound_object: None,
        base_offset: 0,
        takes_object_by_value: false,
        has_auto_handles: false,
    }
}

fn double_arg(args: &[u32]) -> f64 {
    f64::from_bits(args[0] as u64 | (args[1] as u64) << 32)
}

extern "C" fn mix(a: i32, b: i32) -> i32 {
    a.wrapping_mul(10).wrapping_add(b)
}

fn mix_thunk(_: &mut Context, _: usize, args: &[u32]) -> u64 {
    mix(args[0] as i32, args[1] as i32) as u32 as u64
}

extern "C" fn scale(x: f64, k: i32) -> f64 {
    x * k as f64
}

fn scale_thunk(_: &mut Context, _: usize, args: &[u32]) -> u64 {
    scale(double_arg(args), args[2] as i32).to_bits()
}

extern "C" fn counter_add(counter: *mut i32, n: i32) -> i32 {
    unsafe {
        *counter += n;
        *counter
    }
}

fn counter_thunk(_: &mut Context, obj: usize, args: &[u32]) -> u64 {
    counter_add(obj as *mut i32, args[0] as i32) as u32 as u64
}

extern "C" fn is_even(n: i32) -> bool {
    n % 2 == 0
}

fn is_even_thunk(_: &mut Context, _: usize, args: &[u32]) -> u64 {
    is_even(args[0] as i32) as u64
}

fn generic_thunk(_: &mut Context, _: usize, args: &[u32]) -> u64 {
    (args[0] as i32 - args[1] as i32) as u32 as u64
}

extern "C" fn init_cell(cell: *mut u32, value: u32) {
    unsafe { *cell = value }
}

fn init_thunk(_: &mut Context, obj: usize, args: &[u32]) -> u64 {
    init_cell(obj as *mut u32, args[0]);
    0
}

#[test]
fn test_integer_arithmetic() {
    let mut engine = TestEngine::new();
    engine.add(script(1, 8, |b| {
        b.entry()
            .www(Opcode::AddI, 3, 1, 2)
            .www(Opcode::SubI, 4, 1, 2)
            .www(Opcode::MulI, 5, 3, 4)
            .ww_dw(Opcode::AddIi, 6, 5, (-7i32) as u32)
            .www(Opcode::BXor, 7, 6, 1)
            .www(Opcode::BSra, 8, 7, 2)
            .w(Opcode::NegI, 8)
            .ww(Opcode::CmpI, 8, 1)
            .op(Opcode::Ts)
            .w(Opcode::CpyRtoV4, 3)
            .w(Opcode::Ret, 0);
    }));
    for (x, y) in [(5, 3), (-9, 1), (i32::MAX, 2), (i32::MIN, 31), (0, 0)] {
        let jit = scriptjit::JitCompiler::new(small_pages());
        compile_all(&jit, &engine, &[1]);
        let (interpreted, mixed) = run_both(&engine, 1, &[], |ctx| {
            ctx.set_var(1, x as u32);
            ctx.set_var(2, y as u32);
        });
        assert_same_state(&interpreted, &mixed, &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(mixed.ctx.interpreted, 0);
    }
}

#[test]
fn test_division_by_zero_raises_at_the_division() {
    let mut engine = TestEngine::new();
    engine.add(script(1, 3, |b| {
        b.entry()
            .w_dw(Opcode::SetV4, 1, 100)
            .www(Opcode::DivI, 3, 1, 2)
            .www(Opcode::ModI, 3, 3, 1)
            .w(Opcode::CpyVtoR4, 3)
            .w(Opcode::Ret, 0);
    }));
    let (interpreted, mixed, _jit) = assert_equivalent(&engine, &[1], 1, &[], &[1, 2, 3]);
    assert_eq!(interpreted.outcome, Outcome::Exception("divide by zero".into()));
    assert_eq!(mixed.ctx.regs.program_position, 5);
}

#[test]
fn test_fallback_then_reentry() {
    let mut engine = TestEngine::new();
    // PowI has no native rendition; the interpreter runs it and native
    // code picks up again at the next entry point
    engine.add(script(1, 4, |b| {
        b.entry()
            .w_dw(Opcode::SetV4, 1, 3)
            .w_dw(Opcode::SetV4, 2, 4)
            .www(Opcode::PowI, 3, 1, 2)
            .entry()
            .www(Opcode::AddI, 4, 3, 1)
            .w(Opcode::CpyVtoR4, 4)
            .w(Opcode::Ret, 0);
    }));
    let (_, mixed, jit) = assert_equivalent(&engine, &[1], 1, &[], &[1, 2, 3, 4]);
    assert_eq!(mixed.ctx.value(), 84);
    assert_eq!(mixed.ctx.native_entries, 2);
    assert_eq!(mixed.ctx.interpreted, 1);
    let handle = compile_all(&jit, &engine, &[1])[0];
    assert_eq!(jit.fallback_count(handle), Some(1));
}

#[test]
fn test_floating_point_and_conversions() {
    let mut engine = TestEngine::new();
    engine.add(script(1, 14, |b| {
        b.entry()
            .ww(Opcode::IToD, 4, 1)
            .ww(Opcode::FToD, 6, 2)
            .www(Opcode::MulD, 8, 4, 6)
            .www(Opcode::DivD, 10, 8, 6)
            .ww(Opcode::DToI, 11, 10)
            .ww(Opcode::DToF, 12, 8)
            .www(Opcode::AddF, 13, 12, 2)
            .ww(Opcode::CmpF, 13, 2)
            .w(Opcode::CpyRtoV4, 14)
            .ww(Opcode::CmpD, 10, 4)
            .w(Opcode::Ret, 0);
    }));
    let jit = scriptjit::JitCompiler::new(small_pages());
    compile_all(&jit, &engine, &[1]);
    for (i, f) in [(3, 2.5f32), (-7, 0.5), (0, -0.0), (1, f32::NAN), (i32::MIN, 1e10)] {
        let (interpreted, mixed) = run_both(&engine, 1, &[], |ctx| {
            ctx.set_var(1, i as u32);
            ctx.set_var(2, f.to_bits());
        });
        assert_same_state(&interpreted, &mixed, &[3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14]);
    }
}

#[test]
fn test_native_system_calls() {
    let mut engine = TestEngine::new();
    engine
        .add_host(
            10,
            host(mix as *const () as usize, CallConvention::Cdecl, vec![ParamShape::Int32, ParamShape::Int32], ReturnShape::Int32),
            mix_thunk,
        )
        .add_host(
            11,
            host(scale as *const () as usize, CallConvention::Cdecl, vec![ParamShape::Double, ParamShape::Int32], ReturnShape::Double),
            scale_thunk,
        )
        .add_host(
            12,
            host(is_even as *const () as usize, CallConvention::Cdecl, vec![ParamShape::Int32], ReturnShape::Bool),
            is_even_thunk,
        );
    engine.add(script(1, 6, |b| {
        b.entry()
            // mix(var1, var2): the first argument is pushed last
            .w(Opcode::PshV4, 2)
            .w(Opcode::PshV4, 1)
            .dw(Opcode::CallSys, 10)
            .w(Opcode::CpyRtoV4, 3)
            // scale(var 5..6 as double, var1)
            .w(Opcode::PshV4, 1)
            .w(Opcode::PshV8, 6)
            .dw(Opcode::CallSys, 11)
            .w(Opcode::CpyRtoV8, 6)
            .w(Opcode::PshV4, 3)
            .dw(Opcode::CallSys, 12)
            .w(Opcode::Ret, 0);
    }));
    let jit = scriptjit::JitCompiler::new(small_pages());
    compile_all(&jit, &engine, &[1]);
    let (interpreted, mixed) = run_both(&engine, 1, &[], |ctx| {
        ctx.set_var(1, 4);
        ctx.set_var(2, (-3i32) as u32);
        ctx.set_var64(6, 1.25f64.to_bits());
    });
    assert_same_state(&interpreted, &mixed, &[1, 2, 3, 5, 6]);
    assert_eq!(mixed.ctx.var(3), 37);
    assert_eq!(mixed.ctx.var_f64(6), 5.0);
    assert_eq!(mixed.ctx.value(), 0);
    assert_eq!(mixed.ctx.host_calls, 0, "no call went through the engine");
}

#[test]
fn test_method_call_on_host_object() {
    let mut engine = TestEngine::new();
    engine.add_host(
        10,
        host(counter_add as *const () as usize, CallConvention::Thiscall, vec![ParamShape::Int32], ReturnShape::Int32),
        counter_thunk,
    );
    engine.add(script(1, 4, |b| {
        b.entry()
            .w(Opcode::PshV4, 1)
            .w(Opcode::PshVPtr, 4)
            .dw(Opcode::CallSys, 10)
            .w(Opcode::CpyRtoV4, 1)
            .w(Opcode::Ret, 0);
    }));
    let jit = scriptjit::JitCompiler::new(small_pages());
    compile_all(&jit, &engine, &[1]);
    let mut counters = [100i32, 100];
    let base = counters.as_mut_ptr() as usize;
    let addrs = [base, base + 4];
    let run = |mode, counter: usize| {
        let mut ctx = Context::new(&engine, 1, &[], mode);
        ctx.set_var(1, 23);
        ctx.set_var_ptr_value(4, counter);
        let outcome = ctx.run();
        Run { outcome, ctx }
    };
    let interpreted = run(Mode::Interpreted, addrs[0]);
    let mixed = run(Mode::Mixed, addrs[1]);
    assert_same_state(&interpreted, &mixed, &[1]);
    assert_eq!(mixed.ctx.var(1), 123);
    assert_eq!(counters, [123, 123]);

    // a null object goes back to the interpreter, which raises
    let null = run(Mode::Mixed, 0);
    assert_eq!(null.outcome, Outcome::Exception("null pointer access".into()));
}

#[test]
fn test_generic_call_goes_through_the_engine() {
    let mut engine = TestEngine::new();
    engine.add_host(
        10,
        host(0, CallConvention::Generic, vec![ParamShape::Int32, ParamShape::Int32], ReturnShape::Int32),
        generic_thunk,
    );
    engine.add(script(1, 2, |b| {
        b.entry()
            .w(Opcode::PshV4, 2)
            .w(Opcode::PshV4, 1)
            .dw(Opcode::CallSys, 10)
            .w(Opcode::CpyRtoV4, 1)
            .w(Opcode::Ret, 0);
    }));
    let jit = scriptjit::JitCompiler::new(small_pages());
    compile_all(&jit, &engine, &[1]);
    let (interpreted, mixed) = run_both(&engine, 1, &[], |ctx| {
        ctx.set_var(1, 50);
        ctx.set_var(2, 8);
    });
    assert_same_state(&interpreted, &mixed, &[1, 2]);
    assert_eq!(mixed.ctx.var(1), 42);
    assert_eq!(mixed.ctx.host_calls, 1);
    assert_eq!(mixed.ctx.interpreted, 0);
}

#[test]
fn test_push_eight_byte_variable() {
    let mut engine = TestEngine::new();
    engine.add(script(1, 2, |b| {
        b.entry().w(Opcode::PshV8, 2).op(Opcode::PopRPtr).w(Opcode::Ret, 0);
    }));
    let jit = scriptjit::JitCompiler::new(small_pages());
    compile_all(&jit, &engine, &[1]);
    let (interpreted, mixed) = run_both(&engine, 1, &[], |ctx| ctx.set_var64(2, 0x1122_3344_5566_7788));
    assert_same_state(&interpreted, &mixed, &[1, 2]);
    assert_eq!(interpreted.ctx.regs.value_register, 0x1122_3344_5566_7788);
    assert_eq!(mixed.ctx.interpreted, 0);
}

fn void_thunk(_: &mut Context, _: usize, _: &[u32]) -> u64 {
    0xDEAD
}

#[test]
fn test_void_generic_call_keeps_the_value_register() {
    let mut engine = TestEngine::new();
    engine.add_host(10, host(0, CallConvention::Generic, vec![], ReturnShape::Void), void_thunk);
    engine.add(script(1, 1, |b| {
        b.entry()
            .w_dw(Opcode::SetV4, 1, 7)
            .w(Opcode::CpyVtoR4, 1)
            .dw(Opcode::CallSys, 10)
            .w(Opcode::Ret, 0);
    }));
    let jit = scriptjit::JitCompiler::new(small_pages());
    compile_all(&jit, &engine, &[1]);
    let (interpreted, mixed) = run_both(&engine, 1, &[], |_| {});
    assert_same_state(&interpreted, &mixed, &[1]);
    assert_eq!(mixed.ctx.value(), 7);
    assert_eq!(mixed.ctx.host_calls, 1);
    assert_eq!(mixed.ctx.interpreted, 0);
}

#[test]
fn test_object_lifetime_and_reference_counts() {
    const CELL: usize = 0x1000;
    let mut engine = TestEngine::new();
    engine.add_type(
        CELL,
        ObjectType {
            name: "cell".into(),
            size: 8,
            is_ref: true,
            is_script_object: false,
            behaviours: Behaviours {
                construct: Some(20),
                destruct: None,
                add_ref: Some(ADD_REF),
                release: Some(RELEASE),
            },
        },
    );
    engine.add_host(
        20,
        host(init_cell as *const () as usize, CallConvention::CdeclObjFirst, vec![ParamShape::Int32], ReturnShape::Void),
        init_thunk,
    );
    // var 2 and var 4 hold handles, var 5 an int
    engine.add(script(1, 5, |b| {
        b.entry()
            .w(Opcode::Psf, 2)
            .dw(Opcode::PshC4, 99)
            .ptr_dw(Opcode::Alloc, CELL, 20)
            .w(Opcode::PshVPtr, 2)
            .w_ptr(Opcode::RefCpyV, 4, CELL)
            .op(Opcode::PopPtr)
            .w_ptr(Opcode::Free, 2, CELL)
            .w(Opcode::PshVPtr, 4)
            .op(Opcode::PopRPtr)
            .w(Opcode::Rdr4, 5)
            .w_ptr(Opcode::Free, 4, CELL)
            .w(Opcode::CpyVtoR4, 5)
            .w(Opcode::Ret, 0);
    }));
    let (interpreted, mixed, _jit) = assert_equivalent(&engine, &[1], 1, &[], &[5]);
    assert_eq!(mixed.ctx.value(), 99);
    assert_eq!(mixed.ctx.frees, 1);
    assert!(mixed.ctx.objects.is_empty());
    assert_eq!(mixed.ctx.var_ptr_value(2), 0);
    assert_eq!(interpreted.ctx.var_ptr_value(4), 0);
    assert_eq!(mixed.ctx.interpreted, 0);
}

#[test]
fn test_destruct_then_free_without_reference_counting() {
    const PLAIN: usize = 0x2000;
    let mut engine = TestEngine::new();
    engine.add_type(
        PLAIN,
        ObjectType {
            name: "plain".into(),
            size: 4,
            is_ref: false,
            is_script_object: false,
            behaviours: Behaviours {
                construct: None,
                destruct: Some(DESTRUCT),
                add_ref: None,
                release: None,
            },
        },
    );
    engine.add(script(1, 2, |b| {
        b.entry()
            .w(Opcode::Psf, 2)
            .ptr_dw(Opcode::Alloc, PLAIN, 0)
            .w_ptr(Opcode::Free, 2, PLAIN)
            // freeing a null handle does nothing
            .w_ptr(Opcode::Free, 2, PLAIN)
            .w(Opcode::Ret, 0);
    }));
    let (_, mixed, _jit) = assert_equivalent(&engine, &[1], 1, &[], &[]);
    assert_eq!(mixed.ctx.destructs, 1);
    assert_eq!(mixed.ctx.frees, 1);
}

#[test]
fn test_nested_script_calls_with_arguments() {
    let mut engine = TestEngine::new();
    // twice(x) = x + x, arguments: one dword
    engine.add(script(2, 1, |b| {
        b.entry().www(Opcode::AddI, 1, 0, 0).w(Opcode::CpyVtoR4, 1).w(Opcode::Ret, 1);
    }));
    // quad(x) = twice(twice(x))
    engine.add(script(1, 1, |b| {
        b.entry()
            .w(Opcode::PshV4, 0)
            .dw(Opcode::Call, 2)
            .entry()
            .w(Opcode::CpyRtoV4, 1)
            .w(Opcode::PshV4, 1)
            .dw(Opcode::Call, 2)
            .entry()
            .w(Opcode::Ret, 1);
    }));
    for ids in [&[1u32, 2][..], &[1][..], &[2][..]] {
        let jit = scriptjit::JitCompiler::new(small_pages());
        compile_all(&jit, &engine, ids);
        let (interpreted, mixed) = run_both(&engine, 1, &[7], |_| {});
        assert_same_state(&interpreted, &mixed, &[0, 1]);
        assert_eq!(mixed.ctx.value(), 28);
        for id in [1, 2] {
            engine.func(id).jit.clear();
        }
    }
}

#[test]
fn test_interface_and_bound_calls() {
    let mut engine = TestEngine::new();
    engine.add(script(3, 1, |b| {
        b.entry().w_dw(Opcode::SetV4, 1, 31).w(Opcode::CpyVtoR4, 1).w(Opcode::Ret, 0);
    }));
    engine.add_override(50, 3).add_import(7, 3);
    engine.add(script(1, 2, |b| {
        b.entry()
            .dw(Opcode::CallIntf, 50)
            .entry()
            .w(Opcode::CpyRtoV4, 1)
            .dw(Opcode::CallBnd, 7)
            .entry()
            .w(Opcode::CpyRtoV4, 2)
            .www(Opcode::AddI, 1, 1, 2)
            .w(Opcode::CpyVtoR4, 1)
            .w(Opcode::Ret, 0);
    }));
    let (_, mixed, _jit) = assert_equivalent(&engine, &[1, 3], 1, &[], &[1, 2]);
    assert_eq!(mixed.ctx.value(), 62);
    assert_eq!(mixed.ctx.native_entries, 1);
    assert_eq!(mixed.ctx.interpreted, 0);
}

#[test]
fn test_object_register_and_stack_references() {
    let mut engine = TestEngine::new();
    // v4 = move(v2) through the object register, then read v4 back through
    // a reference to it and through its content
    engine.add(script(1, 5, |b| {
        b.entry()
            .w(Opcode::LoadObj, 2)
            .w(Opcode::StoreObj, 4)
            .w(Opcode::ChkNullV, 4)
            .w(Opcode::GetRef, 0)
            .op(Opcode::RdsPtr)
            .op(Opcode::ChkRef)
            .op(Opcode::PopRPtr)
            .w(Opcode::GetObjRef, 0)
            .w(Opcode::ChkNullS, 0)
            .op(Opcode::PopPtr)
            .w(Opcode::Ret, 0);
    }));
    let jit = scriptjit::JitCompiler::new(small_pages());
    let handle = compile_all(&jit, &engine, &[1])[0];
    assert_eq!(jit.fallback_count(handle), Some(0));

    for object in [0x5000usize, 0] {
        let (interpreted, mixed) = run_both(&engine, 1, &[], |ctx| {
            ctx.set_var_ptr_value(2, object);
            // variable indices the GETREF and GETOBJREF slots refer to
            ctx.push_ptr(4);
            ctx.push_ptr(4);
        });
        assert_same_state(&interpreted, &mixed, &[1, 2, 3, 4]);
        assert_eq!(mixed.ctx.var_ptr_value(2), 0, "moved out");
        assert_eq!(mixed.ctx.var_ptr_value(4), object);
        assert!(mixed.ctx.regs.object_register.is_null());
        if object == 0 {
            assert_eq!(mixed.outcome, Outcome::Exception("null pointer access".into()));
        } else {
            assert_eq!(mixed.outcome, Outcome::Finished);
            assert_eq!(mixed.ctx.regs.value_register, object as u64);
            assert_eq!(mixed.ctx.interpreted, 0);
        }
    }
}
