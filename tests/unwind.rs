//! Integration tests for the unwind engines.
//!
//! Each test lays out a synthetic call chain in simulated memory: function tables for a
//! fake image, the unwind data those tables point at, and a stack whose frames were built
//! the way the described prologs would build them. The engines must then walk the chain
//! back to the stack base, restoring every saved register on the way.

use std::sync::Arc;

use ldrkit::{
    prelude::*,
    unwind::{
        arm64::{FP, LR},
        x86_64::{reg, unwind_op},
    },
    Result,
};

const IMAGE_BASE: u64 = 0x1000_0000;
const STACK_BASE: u64 = 0x7000_0000;
const JIT_BASE: u64 = 0x2000_0000;

/// Offset of the call site inside every synthetic function body.
const BODY: u64 = 0x40;

// ------------------------------------------------------------------------------------------------
// x86-64
// ------------------------------------------------------------------------------------------------

/// `push rbx; sub rsp, 0x20`: every frame is 0x30 bytes including its return address.
fn x64_frame_info() -> Vec<u8> {
    vec![
        1,    // version 1, no flags
        5,    // prolog size
        2,    // code count
        0,    // no frame register
        5,    // sub rsp, 0x20
        unwind_op::ALLOC_SMALL | 3 << 4,
        1, // push rbx
        unwind_op::PUSH_NONVOL | (reg::RBX as u8) << 4,
    ]
}

const X64_FRAME: u64 = 0x30;

/// A chain of `depth` functions where function `i` was called from the body of function
/// `i + 1`, and the outermost one returns to address zero at the stack base.
struct X64Chain {
    engine: X64Unwinder,
    memory: SimulatedMemory,
    context: X64Context,
}

fn function_address(index: usize) -> u64 {
    IMAGE_BASE + 0x1000 + index as u64 * 0x100
}

fn x64_chain(depth: usize) -> Result<X64Chain> {
    let mut memory = SimulatedMemory::new();
    memory.map_zeroed(IMAGE_BASE, 0x10000)?;
    memory.map_zeroed(STACK_BASE - 0x1000, 0x1000)?;
    memory.write(IMAGE_BASE + 0x3000, &x64_frame_info())?;

    let functions = (0..depth)
        .map(|i| {
            let begin = 0x1000 + i as u32 * 0x100;
            RuntimeFunction::new(begin, begin + 0x100, 0x3000)
        })
        .collect();
    let tables = Arc::new(FunctionTables::new());
    tables.register_module("chain.dll", IMAGE_BASE, 0x10000, functions);

    let innermost = STACK_BASE - X64_FRAME * depth as u64;
    for i in 0..depth {
        let sp = innermost + X64_FRAME * i as u64;
        let caller = if i + 1 < depth {
            function_address(i + 1) + BODY
        } else {
            0
        };
        memory.write_u64(sp + 0x20, 0xb000 + i as u64)?;
        memory.write_u64(sp + 0x28, caller)?;
    }

    let mut context = X64Context::new(function_address(0) + BODY, innermost);
    context.gpr[reg::RBX] = 0xdead;
    Ok(X64Chain {
        engine: X64Unwinder::new(tables),
        memory,
        context,
    })
}

#[test]
fn test_x64_chain_unwinds_to_stack_base() -> Result<()> {
    const DEPTH: usize = 6;
    let X64Chain {
        engine,
        memory,
        mut context,
    } = x64_chain(DEPTH)?;

    let mut steps = 0;
    while context.rip != 0 {
        let lookup = engine.lookup_function(context.rip, &memory, None);
        assert_eq!(
            lookup.as_ref().map(|l| l.begin_va()),
            Some(function_address(steps))
        );
        let sp = context.rsp();
        let frame =
            engine.unwind_one_frame(UnwindFlags::empty(), lookup.as_ref(), &mut context, &memory)?;

        assert_eq!(frame.establisher_frame, sp);
        assert_eq!(context.rsp(), sp + X64_FRAME);
        assert_eq!(context.gpr[reg::RBX], 0xb000 + steps as u64);
        steps += 1;
        assert!(steps <= DEPTH);
    }

    assert_eq!(steps, DEPTH);
    assert_eq!(context.rsp(), STACK_BASE);
    Ok(())
}

#[test]
fn test_x64_backtrace() -> Result<()> {
    let chain = x64_chain(4)?;
    let frames = backtrace(&chain.engine, &chain.context, &chain.memory, 64);
    let expected: Vec<u64> = (0..4).map(|i| function_address(i) + BODY).collect();
    assert_eq!(frames, expected);

    let truncated = backtrace(&chain.engine, &chain.context, &chain.memory, 2);
    assert_eq!(truncated, expected[..2]);
    Ok(())
}

#[test]
fn test_x64_leaf_frame_on_top() -> Result<()> {
    let X64Chain {
        engine,
        mut memory,
        context,
    } = x64_chain(3)?;

    // A leaf routine without metadata, called from the innermost function
    let leaf_sp = context.rsp() - 8;
    memory.write_u64(leaf_sp, function_address(0) + BODY)?;
    let leaf = X64Context::new(IMAGE_BASE + 0x9000, leaf_sp);

    let frames = backtrace(&engine, &leaf, &memory, 64);
    assert_eq!(frames.len(), 4);
    assert_eq!(frames[0], IMAGE_BASE + 0x9000);
    assert_eq!(frames[1], function_address(0) + BODY);
    Ok(())
}

#[test]
fn test_x64_metadata_gap_stops_walk() -> Result<()> {
    let X64Chain {
        engine,
        mut memory,
        context,
    } = x64_chain(4)?;

    // Function 1 returns into unregistered code: only the first frame may lack metadata
    let frame_1 = context.rsp() + X64_FRAME;
    memory.write_u64(frame_1 + 0x28, IMAGE_BASE + 0x9000)?;

    let frames = backtrace(&engine, &context, &memory, 64);
    assert_eq!(
        frames,
        [
            function_address(0) + BODY,
            function_address(1) + BODY,
            IMAGE_BASE + 0x9000
        ]
    );
    Ok(())
}

#[test]
fn test_x64_dynamic_function_table() -> Result<()> {
    let X64Chain {
        mut memory,
        mut context,
        ..
    } = x64_chain(2)?;
    memory.map_zeroed(JIT_BASE, 0x1000)?;
    memory.write(JIT_BASE + 0x800, &x64_frame_info())?;

    let tables = Arc::new(FunctionTables::new());
    let id = tables.install_table_callback(
        JIT_BASE,
        0x800,
        Arc::new(|pc: u64| (pc < JIT_BASE + 0x100).then(|| RuntimeFunction::new(0, 0x100, 0x800))),
    );
    let engine = X64Unwinder::new(tables.clone());

    // Generated code at the top of the stack, called from outside any table
    let sp = context.rsp() - X64_FRAME;
    memory.write_u64(sp + 0x20, 0x1111)?;
    memory.write_u64(sp + 0x28, 0x4242)?;
    context.rip = JIT_BASE + 0x10;
    context.set_stack_pointer(sp);

    let lookup = engine.lookup_function(context.rip, &memory, None);
    assert_eq!(lookup.as_ref().map(|l| l.image_base), Some(JIT_BASE));
    engine.unwind_one_frame(UnwindFlags::empty(), lookup.as_ref(), &mut context, &memory)?;
    assert_eq!(context.rip, 0x4242);
    assert_eq!(context.gpr[reg::RBX], 0x1111);

    assert!(tables.delete_function_table(id));
    assert!(engine
        .lookup_function(JIT_BASE + 0x10, &memory, None)
        .is_none());
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// ARM64
// ------------------------------------------------------------------------------------------------

/// Packed unwind data for a 0x80 byte function saving x19/x20 with a chained frame record
/// and a 64 byte frame.
const ARM64_PACKED: u32 = 1 | 0x20 << 2 | 2 << 16 | 3 << 21 | 4 << 23;

/// Distance between the frame pointers of consecutive frames.
const ARM64_STRIDE: u64 = 0x60;

fn arm64_function(index: usize) -> u64 {
    IMAGE_BASE + 0x1000 + index as u64 * 0x80
}

#[test]
fn test_arm64_packed_chain_unwinds_to_stack_base() -> Result<()> {
    const DEPTH: usize = 3;
    let mut memory = SimulatedMemory::new();
    memory.map_zeroed(IMAGE_BASE, 0x10000)?;
    memory.map_zeroed(STACK_BASE - 0x1000, 0x1000)?;

    let functions = (0..DEPTH)
        .map(|i| {
            let begin = 0x1000 + i as u32 * 0x80;
            RuntimeFunction::new(begin, begin + 0x80, ARM64_PACKED)
        })
        .collect();
    let tables = Arc::new(FunctionTables::new());
    tables.register_module("chain.dll", IMAGE_BASE, 0x10000, functions);
    let engine = Arm64Unwinder::new(tables);

    // Frame i: frame record at fp, x19/x20 at fp + 48, caller sp at fp + 64
    let fp_of = |i: usize| STACK_BASE - ARM64_STRIDE * (DEPTH - i) as u64 + 0x20;
    for i in 0..DEPTH {
        let fp = fp_of(i);
        let (caller_fp, return_address) = if i + 1 < DEPTH {
            (fp_of(i + 1), arm64_function(i + 1) + BODY + 4)
        } else {
            (0, 0)
        };
        memory.write_u64(fp, caller_fp)?;
        memory.write_u64(fp + 8, return_address)?;
        memory.write_u64(fp + 48, 0x1900 + i as u64)?;
        memory.write_u64(fp + 56, 0x2000 + i as u64)?;
    }

    let mut context = Arm64Context::new(arm64_function(0) + BODY, fp_of(0) - 0x20, 0);
    context.x[FP] = fp_of(0);

    for i in 0..DEPTH {
        let lookup_pc = if context.unwound_to_call {
            context.pc - 4
        } else {
            context.pc
        };
        let lookup = engine.lookup_function(lookup_pc, &memory, None);
        assert_eq!(lookup.as_ref().map(|l| l.begin_va()), Some(arm64_function(i)));
        engine.unwind_one_frame(UnwindFlags::empty(), lookup.as_ref(), &mut context, &memory)?;

        assert_eq!(context.x[19], 0x1900 + i as u64);
        assert_eq!(context.x[20], 0x2000 + i as u64);
        assert_eq!(context.sp, fp_of(i) + 64);
        assert_eq!(context.pc, context.x[LR]);
    }

    assert_eq!(context.pc, 0);
    assert_eq!(context.sp, STACK_BASE);
    Ok(())
}

#[test]
fn test_arm64_leaf_uses_link_register() -> Result<()> {
    let memory = SimulatedMemory::new();
    let engine = Arm64Unwinder::new(Arc::new(FunctionTables::new()));
    let context = Arm64Context::new(IMAGE_BASE + 0x500, STACK_BASE - 0x10, 0x4444);

    let frames = backtrace(&engine, &context, &memory, 8);
    assert_eq!(frames, [IMAGE_BASE + 0x500, 0x4444]);
    Ok(())
}
