mod common;

use common::*;
use std::collections::HashMap;
use x86_dft::*;
use x86_dft::Register::*;

#[test]
fn load_move_store() {
    init_logging();
    let mut engine = small_engine();
    let mut ctx = engine.thread_start();
    engine.tagmap_mut().set_all(0x1000, 1);

    // mov eax, [0x1000]; mov ebx, eax; mov [0x2000], ebx
    execute(&mut engine, &mut ctx, &Ins::new(Opcode::Mov).reg(Eax).mem(4), &Args::default().read(0x1000));
    execute(&mut engine, &mut ctx, &Ins::new(Opcode::Mov).reg(Ebx).reg(Eax), &Args::default());
    execute(&mut engine, &mut ctx, &Ins::new(Opcode::Mov).mem(4).reg(Ebx), &Args::default().write(0x2000));

    assert_eq!(ctx.vcpu.word(Gpr::Ebx), VCPU_MASK8);
    assert_eq!(engine.tagmap().get(0x2000, 1), 1);
    assert_eq!(engine.tagmap().get(0x2001, 3), engine.tagmap().get(0x1001, 3));
    assert_eq!(engine.tagmap().get(0x2000, 4), engine.tagmap().get(0x1000, 4));
}

#[test]
fn cbw_extends_al_into_ah() {
    init_logging();
    let mut engine = small_engine();
    let mut ctx = engine.thread_start();
    ctx.vcpu.set(op(Al), 1);
    execute(&mut engine, &mut ctx, &Ins::new(Opcode::Cbw), &Args::default());
    assert_eq!(ctx.vcpu.get(op(Ah)), 1);
    assert_eq!(ctx.vcpu.get(op(Al)), 1);
    assert_eq!(ctx.vcpu.word(Gpr::Eax), VCPU_MASK16);
}

fn cmpxchg_mem_ebx(equal: bool) -> (ThreadContext, Engine) {
    let mut engine = small_engine();
    let mut ctx = engine.thread_start();
    ctx.vcpu.set_word(Gpr::Ebx, VCPU_MASK32);
    engine.tagmap_mut().set_bits(0x3000, 4, 0b0010);

    let mut args = Args::default().read(0x3000).write(0x3000).value(Eax, 7);
    args.mem_value = if equal { 7 } else { 8 };
    execute(&mut engine, &mut ctx, &Ins::new(Opcode::Cmpxchg).mem(4).reg(Ebx).implicit(Eax), &args);
    (ctx, engine)
}

#[test]
fn cmpxchg_taken() {
    init_logging();
    let (ctx, engine) = cmpxchg_mem_ebx(true);
    assert_eq!(engine.tagmap().get(0x3000, 4), VCPU_MASK32);
    assert_eq!(ctx.vcpu.word(Gpr::Eax), 0);
    assert_eq!(ctx.vcpu.word(Gpr::Ebx), VCPU_MASK32);
}

#[test]
fn cmpxchg_not_taken() {
    init_logging();
    let (ctx, engine) = cmpxchg_mem_ebx(false);
    assert_eq!(ctx.vcpu.word(Gpr::Eax), 0b0010);
    assert_eq!(engine.tagmap().get(0x3000, 4), 0b0010);
}

#[test]
fn clear_idiom_leaves_no_stale_taint() {
    init_logging();
    let mut engine = small_engine();
    for &opcode in &[Opcode::Xor, Opcode::Sub, Opcode::Sbb] {
        for &reg in &[Ecx, Cx, Cl, Ch] {
            for word in 0..=VCPU_MASK32 {
                let mut ctx = engine.thread_start();
                ctx.vcpu.set_word(Gpr::Ecx, word);
                execute(&mut engine, &mut ctx, &Ins::new(opcode).reg(reg).reg(reg), &Args::default());
                assert_eq!(ctx.vcpu.get(op(reg)), 0);
                assert_eq!(ctx.vcpu.word(Gpr::Ecx), word & !op(reg).view.mask());
            }
        }
    }
}

#[test]
fn predicated_calls_follow_the_condition() {
    init_logging();
    let mut engine = small_engine();
    let mut ctx = engine.thread_start();
    ctx.vcpu.set_word(Gpr::Edx, VCPU_MASK32);
    let cmov = Ins::new(Opcode::Cmov(Condition::Z)).reg(Eax).reg(Edx);

    let mut args = Args::default();
    args.condition = false;
    execute(&mut engine, &mut ctx, &cmov, &args);
    assert_eq!(ctx.vcpu.word(Gpr::Eax), 0);

    args.condition = true;
    execute(&mut engine, &mut ctx, &cmov, &args);
    assert_eq!(ctx.vcpu.word(Gpr::Eax), VCPU_MASK32);
}

#[test]
fn rep_stos_updates_memory_once() {
    init_logging();
    let mut engine = small_engine();
    let mut ctx = engine.thread_start();
    ctx.vcpu.set(op(Al), 1);

    let mut exe = MockExecuter::default();
    let stosb = Ins::new(Opcode::Stosb).mem(1).rep();
    engine.instrument(&mut exe, &stosb);

    let mut args = Args::default().write(0x500).value(Ecx, 16).value(Eflags, 0x202);
    engine.run(&mut ctx, &exe.calls, &args);
    assert!((0x500..0x510).all(|a| engine.tagmap().get(a, 1) == 1));
    assert_eq!(engine.tagmap().get(0x510, 1), 0);

    // later iterations leave the shadow memory alone
    ctx.vcpu.clear(op(Al));
    args.first_iteration = false;
    args.write_ea = 0x501;
    args.regs.insert(Ecx, 15);
    engine.run(&mut ctx, &exe.calls, &args);
    assert!((0x500..0x510).all(|a| engine.tagmap().get(a, 1) == 1));
}

#[test]
fn rep_stos_backwards() {
    init_logging();
    let mut engine = small_engine();
    let mut ctx = engine.thread_start();
    ctx.vcpu.set_word(Gpr::Eax, VCPU_MASK32);
    // edi points at the first dword stored, the highest one
    let args = Args::default().write(0x6fc).value(Ecx, 4).value(Eflags, 0x602);
    execute(&mut engine, &mut ctx, &Ins::new(Opcode::Stosd).mem(4).rep(), &args);
    assert_eq!(engine.tagmap().get(0x6ef, 1), 0);
    assert!((0x6f0..=0x6ff).all(|a| engine.tagmap().get(a, 1) == 1));
    assert_eq!(engine.tagmap().get(0x700, 1), 0);
}

#[test]
fn pushad_popad_round_trip() {
    init_logging();
    let mut engine = small_engine();
    let mut ctx = engine.thread_start();
    for (i, &slot) in Gpr::ALL.iter().enumerate() {
        ctx.vcpu.set_word(slot, (i as u32 + 5) & VCPU_MASK32);
    }
    let saved = ctx.vcpu.clone();
    execute(&mut engine, &mut ctx, &Ins::new(Opcode::Pushad), &Args::default().write(0x7000));

    // clobber everything, then pop it all back
    let mut ctx2 = engine.thread_start();
    ctx2.vcpu.set_word(Gpr::Esp, 0);
    execute(&mut engine, &mut ctx2, &Ins::new(Opcode::Popad), &Args::default().read(0x7000));
    for &slot in &Gpr::ALL {
        if slot == Gpr::Esp {
            assert_eq!(ctx2.vcpu.word(slot), 0);
        } else {
            assert_eq!(ctx2.vcpu.word(slot), saved.word(slot), "{:?}", slot);
        }
    }
}

#[test]
fn threads_have_their_own_registers() {
    init_logging();
    let mut engine = small_engine();
    let mut a = engine.thread_start();
    let mut b = engine.thread_start();
    a.vcpu.set_word(Gpr::Esi, VCPU_MASK32);

    // thread a stores a tainted esi; thread b loads it into edi
    execute(&mut engine, &mut a, &Ins::new(Opcode::Push).reg(Esi).stack(4), &Args::default().write(0x8000));
    assert!(!b.vcpu.any_tainted());
    execute(&mut engine, &mut b, &Ins::new(Opcode::Pop).reg(Edi).stack(4), &Args::default().read(0x8000));
    assert_eq!(b.vcpu.word(Gpr::Edi), VCPU_MASK32);
    assert_eq!(a.vcpu.word(Gpr::Edi), 0);
}

/// A sparse tag map, to show the engine doesn't depend on `Bitmap`
#[derive(Default)]
struct SparseTags(HashMap<u32, bool>);

impl TagMap for SparseTags {
    fn get(&self, addr: u32, width: usize) -> u32 {
        (0..width as u32)
            .filter(|i| self.0.get(&(addr + i)).copied().unwrap_or(false))
            .fold(0, |acc, i| acc | (1 << i))
    }

    fn set_bits(&mut self, addr: u32, width: usize, value: u32) {
        for i in 0..width as u32 {
            self.0.insert(addr + i, value & (1 << i) != 0);
        }
    }
}

#[test]
fn custom_tag_map() {
    init_logging();
    let mut engine = Engine::with_tagmap(Config::default(), SparseTags::default());
    let mut ctx = engine.thread_start();
    engine.tagmap_mut().set_all(0xdead_0000, 2);

    let mut exe = MockExecuter::default();
    engine.instrument(&mut exe, &Ins::new(Opcode::Movzx).reg(Eax).mem(2));
    engine.run(&mut ctx, &exe.calls, &Args::default().read(0xdead_0000));
    assert_eq!(ctx.vcpu.word(Gpr::Eax), VCPU_MASK32);

    let mut exe = MockExecuter::default();
    engine.instrument(&mut exe, &Ins::new(Opcode::Stosw).mem(2).rep());
    let args = Args::default().write(0xbeef_0000).value(Ecx, 3).value(Eflags, 0);
    engine.run(&mut ctx, &exe.calls, &args);
    assert!(engine.tagmap().is_tainted(0xbeef_0000, 6));
    assert!(!engine.tagmap().is_tainted(0xbeef_0006, 1));
}

#[test]
fn init_and_teardown() {
    init_logging();
    let mut config = Config::default();
    config.address_space = 0;
    assert!(matches!(Engine::init(config), Err(Error::InvalidAddressSpace(0))));

    let engine = small_engine();
    assert_eq!(engine.tagmap().address_space(), 1 << 16);
    assert_eq!(engine.config().unhandled, UnhandledHandling::Log);
    engine.teardown();
}
