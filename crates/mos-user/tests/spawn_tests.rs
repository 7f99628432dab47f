//! Spawning programs from image files

mod common;

use std::sync::mpsc;

use common::{assert_clean, boot_fs, console_text, run, WAIT};
use mos_ipc::{Errno, OpenMode};
use mos_kernel::Machine;
use mos_user::testing::MemoryFs;
use mos_user::{image_header, libmain, spawn, user_panic};

#[test]
fn test_spawn_passes_arguments() {
    let machine = Machine::default();
    let echo = machine.install_program("echo", |gw, tf| {
        libmain(gw, tf, |rt, args| {
            rt.print(&args[1..].join(" "));
            rt.print("\n");
            Ok(())
        })
    });
    boot_fs(&machine, MemoryFs::new().with_file("/bin/echo", &image_header(echo)));

    run(&machine, |rt| {
        let child = spawn(rt, "/bin/echo", &["echo", "hello", "world"]).unwrap();
        assert!(machine.wait_for_exit(child, WAIT));
        assert_eq!(rt.fd_alloc().unwrap(), 0);
    });
    assert_eq!(console_text(&machine), "hello world\n");
    assert_clean(&machine);
}

#[test]
fn test_spawn_with_no_arguments() {
    let machine = Machine::default();
    let (tx, rx) = mpsc::channel();
    let entry = machine.install_program("count", move |gw, tf| {
        let tx = tx.clone();
        libmain(gw, tf, move |_, args| {
            let _ = tx.send(args.len());
            Ok(())
        })
    });
    boot_fs(&machine, MemoryFs::new().with_file("/count", &image_header(entry)));

    run(&machine, |rt| {
        let child = spawn(rt, "/count", &[]).unwrap();
        assert!(machine.wait_for_exit(child, WAIT));
    });
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), 0);
}

#[test]
fn test_spawned_child_inherits_console_fd() {
    let machine = Machine::default();
    let entry = machine.install_program("greet", |gw, tf| {
        libmain(gw, tf, |rt, _| {
            if !rt.iscons(0)? {
                user_panic!("fd 0 is not the console");
            }
            rt.write(0, b"from child\n")?;
            Ok(())
        })
    });
    boot_fs(&machine, MemoryFs::new().with_file("/greet", &image_header(entry)));

    run(&machine, |rt| {
        assert_eq!(rt.opencons().unwrap(), 0);
        let child = spawn(rt, "/greet", &["greet"]).unwrap();
        assert!(machine.wait_for_exit(child, WAIT));
        // The parent's descriptor is untouched by the child's exit.
        assert!(rt.iscons(0).unwrap());
    });
    assert_eq!(console_text(&machine), "from child\n");
    assert_clean(&machine);
}

#[test]
fn test_spawned_child_shares_open_file() {
    let machine = Machine::default();
    let entry = machine.install_program("append", |gw, tf| {
        libmain(gw, tf, |rt, args| {
            let fd: u32 = match args.get(1).and_then(|a| a.parse().ok()) {
                Some(fd) => fd,
                None => user_panic!("usage: append <fd>"),
            };
            rt.write(fd, b" + child")?;
            Ok(())
        })
    });
    boot_fs(&machine, MemoryFs::new().with_file("/append", &image_header(entry)));

    run(&machine, |rt| {
        let fd = rt.open("/out", OpenMode::CREAT | OpenMode::RDWR).unwrap();
        rt.write(fd, b"parent").unwrap();
        let arg = fd.to_string();
        let child = spawn(rt, "/append", &["append", arg.as_str()]).unwrap();
        assert!(machine.wait_for_exit(child, WAIT));
        rt.close(fd).unwrap();

        let fd = rt.open("/out", OpenMode::RDONLY).unwrap();
        let mut buf = [0u8; 32];
        let n = rt.readn(fd, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"parent + child");
        rt.close(fd).unwrap();
    });
    assert_clean(&machine);
}

#[test]
fn test_spawn_rejects_non_images() {
    let machine = Machine::default();
    boot_fs(
        &machine,
        MemoryFs::new()
            .with_file("/script", b"#!/bin/sh\necho hi\n")
            .with_file("/tiny", b"MOS"),
    );

    run(&machine, |rt| {
        let envs_before = machine.envs().len();
        assert_eq!(spawn(rt, "/script", &["script"]).unwrap_err().errno(), Some(Errno::NotExec));
        assert_eq!(spawn(rt, "/tiny", &[]).unwrap_err().errno(), Some(Errno::NotExec));
        assert_eq!(spawn(rt, "/missing", &[]).unwrap_err().errno(), Some(Errno::NotFound));
        assert_eq!(machine.envs().len(), envs_before);
        assert_eq!(rt.fd_alloc().unwrap(), 0);
    });
    assert_clean(&machine);
}

#[test]
fn test_spawned_program_panic_is_reported() {
    let machine = Machine::default();
    let entry = machine.install_program("broken", |gw, tf| {
        libmain(gw, tf, |_, args| user_panic!("cannot handle {} args", args.len()))
    });
    boot_fs(&machine, MemoryFs::new().with_file("/broken", &image_header(entry)));

    run(&machine, |rt| {
        let child = spawn(rt, "/broken", &["broken", "x"]).unwrap();
        assert!(machine.wait_for_exit(child, WAIT));
    });
    let console = console_text(&machine);
    assert!(console.contains("panic at"), "{console}");
    assert!(console.contains("cannot handle 2 args"), "{console}");
    assert_clean(&machine);
}

#[test]
fn test_program_without_entry_is_not_run() {
    let machine = Machine::default();
    boot_fs(&machine, MemoryFs::new().with_file("/ghost", &image_header(0x0070_0000)));

    run(&machine, |rt| {
        // The image parses, but nothing is installed at its entry.
        let child = spawn(rt, "/ghost", &["ghost"]).unwrap();
        assert!(machine.wait_for_exit(child, WAIT));
    });
    assert_clean(&machine);
}
