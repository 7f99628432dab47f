//! Copy-on-write fork and user-level page-fault handling

mod common;

use std::sync::mpsc;

use common::{assert_clean, boot_fs, console_text, run, SCRATCH, WAIT};
use mos_ipc::mmu::BY2PG;
use mos_ipc::{OpenMode, Perm, Syscalls, Va};
use mos_kernel::{EnvGateway, Machine, MachineError};
use mos_user::testing::MemoryFs;
use mos_user::{cow_handler, fork, set_pgfault_handler, user_panic, Result, Runtime, RuntimeConfig};

#[test]
fn test_cow_pages_are_private_after_first_write() {
    let machine = Machine::default();
    let (tx, rx) = mpsc::channel();

    run(&machine, |rt| {
        rt.syscall_mem_alloc(0, SCRATCH, Perm::RW).unwrap();
        rt.store(SCRATCH, b"before").unwrap();

        let child = fork(rt, move |crt| {
            let mut seen = [0u8; 6];
            crt.load(SCRATCH, &mut seen)?;
            crt.store(SCRATCH, b"child!")?;
            let mut after = [0u8; 6];
            crt.load(SCRATCH, &mut after)?;
            let _ = tx.send((seen, after, crt.pgfault_count(), crt.envid()));
            Ok(())
        })
        .unwrap();

        rt.store(SCRATCH, b"parent").unwrap();
        assert_eq!(rt.pgfault_count(), 1);
        rt.store(SCRATCH, b"again!").unwrap();
        assert_eq!(rt.pgfault_count(), 1);
        assert_eq!(machine.env_metrics(rt.envid()).unwrap().pgfaults, 1);

        let (seen, after, faults, id) = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(&seen, b"before");
        assert_eq!(&after, b"child!");
        assert_eq!(faults, 1);
        assert_eq!(id, child);

        let mut mine = [0u8; 6];
        rt.load(SCRATCH, &mut mine).unwrap();
        assert_eq!(&mine, b"again!");
        assert!(machine.wait_for_exit(child, WAIT));
    });
    assert_clean(&machine);
}

#[test]
fn test_fork_shares_read_only_pages() {
    let machine = Machine::default();
    run(&machine, |rt| {
        rt.syscall_mem_alloc(0, SCRATCH, Perm::RW).unwrap();
        rt.store(SCRATCH, b"ro").unwrap();
        rt.syscall_mem_map(0, SCRATCH, 0, SCRATCH, Perm::VALID).unwrap();

        let child = fork(rt, |_| Ok(())).unwrap();
        assert_eq!(rt.sys().vpt(SCRATCH), Some(Perm::VALID));
        assert!(machine.wait_for_exit(child, WAIT));
    });
    assert_clean(&machine);
}

#[test]
fn test_non_cow_fault_is_fatal() {
    let machine = Machine::default();
    run(&machine, |rt| {
        set_pgfault_handler(rt, cow_handler).unwrap();
        rt.syscall_mem_alloc(0, SCRATCH, Perm::VALID).unwrap();
        let err = rt.store(SCRATCH, b"x").unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("non-COW"), "{err}");
    });
}

const OTHER: Va = SCRATCH + BY2PG;

fn reentrant(rt: &Runtime<EnvGateway>, _va: Va) -> Result<()> {
    rt.store(OTHER, b"y")
}

fn ignore(_rt: &Runtime<EnvGateway>, _va: Va) -> Result<()> {
    Ok(())
}

fn give_up(_rt: &Runtime<EnvGateway>, va: Va) -> Result<()> {
    user_panic!("refusing fault at {:08x}", va)
}

#[test]
fn test_fault_inside_handler_is_fatal() {
    let machine = Machine::default();
    run(&machine, |rt| {
        set_pgfault_handler(rt, reentrant).unwrap();
        rt.syscall_mem_alloc(0, SCRATCH, Perm::VALID).unwrap();
        rt.syscall_mem_alloc(0, OTHER, Perm::VALID).unwrap();
        let err = rt.store(SCRATCH, b"x").unwrap_err();
        assert!(err.to_string().contains("while handling"), "{err}");
        // A failed attempt is not a handled fault.
        assert_eq!(rt.pgfault_count(), 0);
    });
}

#[test]
fn test_unresolved_fault_is_fatal() {
    let machine = Machine::default();
    run(&machine, |rt| {
        set_pgfault_handler(rt, ignore).unwrap();
        rt.syscall_mem_alloc(0, SCRATCH, Perm::VALID).unwrap();
        let err = rt.store(SCRATCH, b"x").unwrap_err();
        assert!(err.to_string().contains("persists"), "{err}");
    });
}

#[test]
fn test_handler_error_reaches_the_writer() {
    let machine = Machine::default();
    run(&machine, |rt| {
        set_pgfault_handler(rt, give_up).unwrap();
        rt.syscall_mem_alloc(0, SCRATCH, Perm::VALID).unwrap();
        let err = rt.store(SCRATCH + 8, b"x").unwrap_err();
        assert!(err.to_string().contains("refusing fault at 00500008"), "{err}");
        assert_eq!(rt.pgfault_count(), 0);
    });
}

#[test]
fn test_fault_without_handler_kills() {
    let machine = Machine::default();
    let result = machine.run_env("victim", |gw| {
        let rt = Runtime::new(gw, RuntimeConfig::default());
        rt.syscall_mem_alloc(0, SCRATCH, Perm::VALID).unwrap();
        let _ = rt.store(SCRATCH, b"x");
        unreachable!("the kernel kills an environment with no handler");
    });
    assert!(matches!(result, Err(MachineError::EnvExited(_))));
    assert_eq!(machine.pages_in_use(), 0);
}

#[test]
fn test_child_panic_is_reported_on_console() {
    let machine = Machine::default();
    run(&machine, |rt| {
        let child = fork(rt, |_| user_panic!("child gave up after {} tries", 3)).unwrap();
        assert!(machine.wait_for_exit(child, WAIT));
    });
    let console = console_text(&machine);
    assert!(console.contains("panic at"), "{console}");
    assert!(console.contains("child gave up after 3 tries"), "{console}");
    assert_clean(&machine);
}

#[test]
fn test_fork_shares_open_file_offset() {
    let machine = Machine::default();
    boot_fs(&machine, MemoryFs::new());

    run(&machine, |rt| {
        let fd = rt.open("/log", OpenMode::CREAT | OpenMode::RDWR).unwrap();
        rt.write(fd, b"parent;").unwrap();

        let child = fork(rt, move |crt| {
            crt.write(fd, b"child;")?;
            Ok(())
        })
        .unwrap();
        assert!(machine.wait_for_exit(child, WAIT));

        rt.write(fd, b"done").unwrap();
        rt.close(fd).unwrap();

        let fd = rt.open("/log", OpenMode::RDONLY).unwrap();
        let mut buf = [0u8; 64];
        let n = rt.readn(fd, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"parent;child;done");
        rt.close(fd).unwrap();
    });
    assert_clean(&machine);
}

#[test]
fn test_fork_child_grows_shared_file() {
    let machine = Machine::default();
    boot_fs(&machine, MemoryFs::new().with_file("/grow", b"abc"));

    run(&machine, |rt| {
        let fd = rt.open("/grow", OpenMode::RDWR).unwrap();

        let child = fork(rt, move |crt| {
            crt.seek(fd, BY2PG)?;
            crt.write(fd, b"tail")?;
            Ok(())
        })
        .unwrap();
        assert!(machine.wait_for_exit(child, WAIT));

        assert_eq!(rt.fstat(fd).unwrap().size, BY2PG + 4);
        rt.seek(fd, BY2PG).unwrap();
        let mut buf = [0u8; 4];
        rt.readn(fd, &mut buf).unwrap();
        assert_eq!(&buf, b"tail");
        rt.seek(fd, 0).unwrap();
        rt.readn(fd, &mut buf[..3]).unwrap();
        assert_eq!(&buf[..3], b"abc");
        rt.close(fd).unwrap();
    });
    assert_clean(&machine);
}
