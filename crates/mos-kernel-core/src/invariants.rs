//! Runtime-checkable kernel invariants
//!
//! These hold after every step and are asserted by the tests of every crate
//! that drives the kernel.
//!
//! # Invariants
//!
//! 1. **Consistent Mappings**: No entry is both `COW` and `WRITE`; every entry is `VALID` and below `UTOP`
//! 2. **Page Refcounts**: A page's count equals the number of entries mapping it; mapped pages are never free
//! 3. **Blocked Receivers**: An environment waiting in `ipc_recv` is not runnable
//! 4. **ID Monotonicity**: Every live id is below the next id to hand out

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use mos_ipc::envs::ENV_ID_BASE;
use mos_ipc::mmu::{self, UTOP};
use mos_ipc::{EnvStatus, Perm};

use crate::state::KernelState;
use crate::types::PageId;

/// An invariant violation with details
#[derive(Clone, Debug)]
pub struct InvariantViolation {
    /// Name of the violated invariant
    pub invariant: &'static str,
    /// Description of what went wrong
    pub description: String,
}

/// Check all kernel invariants.
///
/// Returns a list of violations (empty if all invariants hold).
pub fn check_all_invariants(state: &KernelState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    violations.extend(check_consistent_mappings(state));
    violations.extend(check_page_refcounts(state));
    violations.extend(check_blocked_receivers(state));
    violations.extend(check_id_monotonicity(state));

    violations
}

/// Invariant 1: every mapping is valid, below UTOP and never COW+WRITE
fn check_consistent_mappings(state: &KernelState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    for env in state.envs.values() {
        for (&vpn, pte) in &env.pgdir {
            let va = vpn << mmu::PGSHIFT;
            if !pte.perm.is_consistent() {
                violations.push(InvariantViolation {
                    invariant: "consistent_mappings",
                    description: alloc::format!(
                        "Env {:08x} maps {:08x} both COW and WRITE",
                        env.id,
                        va
                    ),
                });
            }
            if !pte.perm.contains(Perm::VALID) {
                violations.push(InvariantViolation {
                    invariant: "consistent_mappings",
                    description: alloc::format!("Env {:08x} maps {:08x} without VALID", env.id, va),
                });
            }
            if va >= UTOP {
                violations.push(InvariantViolation {
                    invariant: "consistent_mappings",
                    description: alloc::format!("Env {:08x} maps {:08x} above UTOP", env.id, va),
                });
            }
        }
    }

    violations
}

/// Invariant 2: page refcounts match the page tables
fn check_page_refcounts(state: &KernelState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    let mut counted: BTreeMap<PageId, u32> = BTreeMap::new();
    for env in state.envs.values() {
        for pte in env.pgdir.values() {
            *counted.entry(pte.page).or_insert(0) += 1;
        }
    }

    for (page, refs) in state.pages.frames() {
        let expected = counted.get(&page).copied().unwrap_or(0);
        if refs != expected {
            violations.push(InvariantViolation {
                invariant: "page_refcounts",
                description: alloc::format!(
                    "Page {} has refcount {} but {} mappings",
                    page.0,
                    refs,
                    expected
                ),
            });
        }
        if expected > 0 && state.pages.is_free(page) {
            violations.push(InvariantViolation {
                invariant: "page_refcounts",
                description: alloc::format!("Page {} is mapped but on the free list", page.0),
            });
        }
    }

    if state.pages.in_use() as usize != counted.len() {
        violations.push(InvariantViolation {
            invariant: "page_refcounts",
            description: alloc::format!(
                "{} pages in use but {} distinct pages mapped",
                state.pages.in_use(),
                counted.len()
            ),
        });
    }

    violations
}

/// Invariant 3: receivers are blocked
fn check_blocked_receivers(state: &KernelState) -> Vec<InvariantViolation> {
    state
        .envs
        .values()
        .filter(|env| env.ipc.recving && env.status != EnvStatus::NotRunnable)
        .map(|env| InvariantViolation {
            invariant: "blocked_receivers",
            description: alloc::format!(
                "Env {:08x} is receiving but has status {:?}",
                env.id,
                env.status
            ),
        })
        .collect()
}

/// Invariant 4: next_env_id is greater than every live id
fn check_id_monotonicity(state: &KernelState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    for env in state.envs.values() {
        if env.id < ENV_ID_BASE || env.id >= state.next_env_id {
            violations.push(InvariantViolation {
                invariant: "id_monotonicity",
                description: alloc::format!(
                    "Env id {:08x} outside [{:08x}, {:08x})",
                    env.id,
                    ENV_ID_BASE,
                    state.next_env_id
                ),
            });
        }
        if env.parent != 0 && env.parent >= env.id {
            violations.push(InvariantViolation {
                invariant: "id_monotonicity",
                description: alloc::format!(
                    "Env {:08x} has parent {:08x} allocated after it",
                    env.id,
                    env.parent
                ),
            });
        }
    }

    violations
}

/// Panic with every violation if any invariant fails.
pub fn assert_invariants(state: &KernelState) {
    let violations = check_all_invariants(state);
    if !violations.is_empty() {
        let mut msg = String::from("Kernel invariant violations:");
        for v in &violations {
            msg.push_str(&alloc::format!("\n  [{}] {}", v.invariant, v.description));
        }
        panic!("{}", msg);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::{step, Syscall};
    use crate::types::Pte;

    fn setup() -> (KernelState, u32) {
        let mut state = KernelState::default();
        let id = state.create_env(0, "init", EnvStatus::Runnable).unwrap();
        (state, id)
    }

    #[test]
    fn test_invariants_hold_for_new_state() {
        assert!(check_all_invariants(&KernelState::default()).is_empty());
    }

    #[test]
    fn test_invariants_hold_after_fork_like_sequence() {
        let (mut state, parent) = setup();
        step(&mut state, parent, Syscall::MemAlloc { envid: 0, va: 0x1000, perm: Perm::RW });
        let child = step(&mut state, parent, Syscall::EnvAlloc)
            .result
            .into_result()
            .unwrap();
        let cow = Perm::VALID | Perm::COW;
        step(
            &mut state,
            parent,
            Syscall::MemMap {
                srcid: 0,
                srcva: 0x1000,
                dstid: child,
                dstva: 0x1000,
                perm: cow,
            },
        );
        step(
            &mut state,
            parent,
            Syscall::MemMap {
                srcid: 0,
                srcva: 0x1000,
                dstid: 0,
                dstva: 0x1000,
                perm: cow,
            },
        );
        assert_invariants(&state);
        step(&mut state, parent, Syscall::EnvDestroy { envid: child });
        assert_invariants(&state);
        assert_eq!(state.pageref(parent, 0x1000), 1);
    }

    #[test]
    fn test_detects_cow_write_mapping() {
        let (mut state, id) = setup();
        let page = state.pages.alloc().unwrap();
        state
            .page_insert(id, 0x1000, page, Perm::RW | Perm::COW)
            .unwrap();
        let v = check_all_invariants(&state);
        assert!(v.iter().any(|v| v.invariant == "consistent_mappings"));
    }

    #[test]
    fn test_detects_refcount_drift() {
        let (mut state, id) = setup();
        let page = state.pages.alloc().unwrap();
        state.page_insert(id, 0x1000, page, Perm::RW).unwrap();
        // Bypass page_insert so the count is not bumped.
        state.env_mut(id).unwrap().pgdir.insert(
            mmu::vpn(0x2000),
            Pte {
                page,
                perm: Perm::RW,
            },
        );
        let v = check_all_invariants(&state);
        assert!(v.iter().any(|v| v.invariant == "page_refcounts"));
    }

    #[test]
    fn test_detects_runnable_receiver() {
        let (mut state, id) = setup();
        state.env_mut(id).unwrap().ipc.recving = true;
        let v = check_all_invariants(&state);
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].invariant, "blocked_receivers");
    }

    #[test]
    fn test_detects_id_monotonicity_violation() {
        let (mut state, _) = setup();
        state.next_env_id = ENV_ID_BASE;
        let v = check_all_invariants(&state);
        assert!(v.iter().any(|v| v.invariant == "id_monotonicity"));
    }

    #[test]
    #[should_panic(expected = "Kernel invariant violations")]
    fn test_assert_invariants_panics_on_violation() {
        let (mut state, id) = setup();
        state.env_mut(id).unwrap().ipc.recving = true;
        assert_invariants(&state);
    }
}
