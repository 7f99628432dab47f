//! Spawning programs.
//!
//! A program image is a file starting with [`IMAGE_MAGIC`] and a little-endian
//! entry address. The child starts at that entry with a fresh stack page
//! holding its arguments:
//!
//! ```text
//!   USTACKTOP ->  ┌──────────────────────────────┐
//!                 │ "argv[0]\0argv[1]\0..."      │
//!                 ├──────────────────────────────┤
//!                 │ argv[0] .. argv[argc-1], 0   │ <- a1
//!                 ├──────────────────────────────┤
//!                 │ argc, argv                   │ <- sp
//!                 └──────────────────────────────┘
//! ```

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use mos_ipc::mmu::{BY2PG, USTACKTOP, UTEMP};
use mos_ipc::{EnvId, EnvStatus, Errno, OpenMode, Perm, Syscalls, Trapframe, Va};

use crate::error::Result;
use crate::runtime::Runtime;
use crate::user_panic;

/// First bytes of every program image
pub const IMAGE_MAGIC: [u8; 4] = *b"MOS\x7f";

/// Header length: magic plus entry address
pub const IMAGE_HEADER_LEN: usize = 8;

/// Build the header of an image starting at `entry`.
pub fn image_header(entry: Va) -> [u8; IMAGE_HEADER_LEN] {
    let mut header = [0u8; IMAGE_HEADER_LEN];
    header[..4].copy_from_slice(&IMAGE_MAGIC);
    header[4..].copy_from_slice(&entry.to_le_bytes());
    header
}

/// Entry address of an image header, `NotExec` if it is not one.
pub fn parse_image_header(header: &[u8]) -> core::result::Result<Va, Errno> {
    if header.len() < IMAGE_HEADER_LEN || header[..4] != IMAGE_MAGIC {
        return Err(Errno::NotExec);
    }
    Ok(u32::from_le_bytes([header[4], header[5], header[6], header[7]]))
}

/// Lay out the argument page. Returns the page image, the child's `sp` and
/// the address of its argv array.
fn build_stack(argv: &[&str]) -> core::result::Result<(Vec<u8>, Va, Va), Errno> {
    let base = USTACKTOP - BY2PG;
    let strings: usize = argv.iter().map(|a| a.len() + 1).sum();
    let argv_len = 4 * (argv.len() + 1);
    let needed = (strings + 3) / 4 * 4 + argv_len + 8;
    if needed > BY2PG as usize {
        return Err(Errno::NoMem);
    }

    let mut page = vec![0u8; BY2PG as usize];
    let str_off = BY2PG as usize - (strings + 3) / 4 * 4;
    let argv_off = str_off - argv_len;
    let sp_off = argv_off - 8;

    let mut cursor = str_off;
    for (i, arg) in argv.iter().enumerate() {
        let ptr = base + cursor as u32;
        page[argv_off + 4 * i..argv_off + 4 * i + 4].copy_from_slice(&ptr.to_le_bytes());
        page[cursor..cursor + arg.len()].copy_from_slice(arg.as_bytes());
        cursor += arg.len() + 1;
    }
    let argv_va = base + argv_off as u32;
    page[sp_off..sp_off + 4].copy_from_slice(&(argv.len() as u32).to_le_bytes());
    page[sp_off + 4..sp_off + 8].copy_from_slice(&argv_va.to_le_bytes());
    Ok((page, base + sp_off as u32, argv_va))
}

/// Decode the argument vector a spawned program was started with.
pub fn read_args<S: Syscalls>(rt: &Runtime<S>, tf: &Trapframe) -> Result<Vec<String>> {
    let argc = tf.regs[Trapframe::A0];
    let argv = tf.regs[Trapframe::A1];
    if argc == 0 {
        return Ok(Vec::new());
    }
    if argc > BY2PG / 4 || argv < USTACKTOP - BY2PG || argv >= USTACKTOP {
        user_panic!("bad argument block: argc {} at {:08x}", argc, argv);
    }

    let mut args = Vec::with_capacity(argc as usize);
    for i in 0..argc {
        let ptr = rt.load_u32(argv + 4 * i)?;
        if !(USTACKTOP - BY2PG..USTACKTOP).contains(&ptr) {
            user_panic!("argv[{}] points outside the stack page: {:08x}", i, ptr);
        }
        let mut bytes = vec![0u8; (USTACKTOP - ptr) as usize];
        rt.load(ptr, &mut bytes)?;
        let Some(len) = bytes.iter().position(|&b| b == 0) else {
            user_panic!("argv[{}] is not terminated", i);
        };
        bytes.truncate(len);
        args.push(String::from_utf8_lossy(&bytes).into_owned());
    }
    Ok(args)
}

/// Start `prog` in a new environment with arguments `argv`.
pub fn spawn<S: Syscalls>(rt: &Runtime<S>, prog: &str, argv: &[&str]) -> Result<EnvId> {
    let fdnum = rt.open(prog, OpenMode::RDONLY)?;
    let mut header = [0u8; IMAGE_HEADER_LEN];
    let read = rt.readn(fdnum, &mut header);
    rt.close(fdnum)?;
    let entry = parse_image_header(&header[..read?])?;

    let (stack, sp, argv_va) = build_stack(argv)?;

    let child = rt.sys().env_alloc(Box::new(drop::<S>))?;
    match start_child(rt, child, entry, &stack, sp, argv_va, argv.len() as u32) {
        Ok(()) => {
            log::debug!(
                "[{:08x}] spawn {} -> {:08x} (entry {:08x}, argc {})",
                rt.envid(),
                prog,
                child,
                entry,
                argv.len()
            );
            Ok(child)
        }
        Err(e) => {
            let _ = rt.syscall_mem_unmap(0, UTEMP);
            let _ = rt.syscall_env_destroy(child);
            Err(e)
        }
    }
}

fn start_child<S: Syscalls>(
    rt: &Runtime<S>,
    child: EnvId,
    entry: Va,
    stack: &[u8],
    sp: Va,
    argv_va: Va,
    argc: u32,
) -> Result<()> {
    rt.syscall_mem_alloc(0, UTEMP, Perm::RW)?;
    rt.store(UTEMP, stack)?;
    rt.syscall_mem_map(0, UTEMP, child, USTACKTOP - BY2PG, Perm::RW)?;
    rt.syscall_mem_unmap(0, UTEMP)?;

    rt.for_each_mapping(0, USTACKTOP, |va, perm| {
        if perm.contains(Perm::LIBRARY) {
            rt.syscall_mem_map(0, va, child, va, perm)
        } else {
            Ok(())
        }
    })?;

    let mut tf = Trapframe::default();
    tf.pc = entry;
    tf.regs[Trapframe::SP] = sp;
    tf.regs[Trapframe::A0] = argc;
    tf.regs[Trapframe::A1] = argv_va;
    rt.syscall_set_trapframe(child, &tf)?;

    rt.incref_shared_files()?;
    rt.syscall_set_env_status(child, EnvStatus::Runnable)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_header() {
        let header = image_header(0x0040_3000);
        assert_eq!(&header[..4], b"MOS\x7f");
        assert_eq!(parse_image_header(&header), Ok(0x0040_3000));
        assert_eq!(parse_image_header(b"\x7fELF\0\0\0\0"), Err(Errno::NotExec));
        assert_eq!(parse_image_header(&header[..6]), Err(Errno::NotExec));
    }

    #[test]
    fn test_stack_layout() {
        let (page, sp, argv_va) = build_stack(&["echo", "hi"]).unwrap();
        let base = USTACKTOP - BY2PG;
        let word = |va: Va| {
            let off = (va - base) as usize;
            u32::from_le_bytes([page[off], page[off + 1], page[off + 2], page[off + 3]])
        };
        assert_eq!(sp % 4, 0);
        assert_eq!(word(sp), 2);
        assert_eq!(word(sp + 4), argv_va);
        assert_eq!(word(argv_va + 8), 0);

        let arg1 = (word(argv_va + 4) - base) as usize;
        assert_eq!(&page[arg1..arg1 + 3], b"hi\0");
        let arg0 = (word(argv_va) - base) as usize;
        assert_eq!(&page[arg0..arg0 + 5], b"echo\0");
    }

    #[test]
    fn test_stack_overflow_is_nomem() {
        let big = "x".repeat(BY2PG as usize);
        assert_eq!(build_stack(&[big.as_str()]), Err(Errno::NoMem));
    }

    #[test]
    fn test_empty_argv() {
        let (page, sp, argv_va) = build_stack(&[]).unwrap();
        assert_eq!(argv_va, USTACKTOP - 4);
        assert_eq!(sp, USTACKTOP - 12);
        assert_eq!(&page[BY2PG as usize - 12..BY2PG as usize - 8], &0u32.to_le_bytes());
    }
}
