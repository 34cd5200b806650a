//! Deterministic CFG-layout engine (spec §4.C): `position_vert` assigns each
//! new node a free `(a, b, bMod)` coordinate based on how execution arrived
//! there. The constants below are fixed tuning values with no semantic
//! meaning beyond producing a visually separated graph.

use crate::graph::{Node, VCoord};
use crate::types::{Address, NodeIndex};
use std::collections::HashSet;
use tracing::warn;

pub const BMULT: i64 = 1000;
pub const JUMPA: i64 = 3;
pub const JUMPB: i64 = 1;
pub const JUMPA_CLASH: i64 = 1;
pub const CALLB: i64 = 1;
pub const CALLA_CLASH: i64 = 1;
pub const CALLB_CLASH: i64 = 1;
pub const RETURNA_OFFSET: i64 = 1;
pub const RETURNB_OFFSET: i64 = 1;
pub const EXTERNA: i64 = 2;
pub const EXTERNB: i64 = 1;

const CLASH_WARN_THRESHOLD: u32 = 15;

/// `lastRIPType`: the transition that produced the previous node, which
/// determines how the *next* node is placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RipType {
    FirstInThread,
    NonFlow,
    Jump,
    Call,
    Return,
    External,
    ExceptionGenerator,
    AfterReturn,
}

pub struct PositionInput {
    pub last_rip_type: RipType,
    /// `None` only when `last_rip_type == FirstInThread`.
    pub last_coord: Option<VCoord>,
    pub last_conditional: bool,
    pub last_cond_taken: Option<Address>,
    pub target_address: Address,
    /// Snapshot of the call stack: `(return_pc, caller_node_idx)`.
    pub call_stack: Vec<(Address, NodeIndex)>,
}

pub struct PositionResult {
    pub coord: VCoord,
    /// If the `External`/`Return` rule matched a call-stack entry, the index
    /// the caller must truncate its call stack to (dropping that entry and
    /// everything above it, per I5).
    pub call_stack_truncate_to: Option<usize>,
}

fn mark_occupied(used: &mut HashSet<(i64, i64)>, max_a: &mut i64, max_b: &mut i64, a: i64, b: i64) {
    used.insert((a, b));
    *max_a = (*max_a).max(a.abs());
    *max_b = (*max_b).max(b.abs());
}

pub fn position_vert(
    nodes: &[Node],
    used_coords: &mut HashSet<(i64, i64)>,
    max_a: &mut i64,
    max_b: &mut i64,
    input: &PositionInput,
) -> PositionResult {
    // FirstInThread is the only case with no previous coordinate.
    let Some(last) = input.last_coord else {
        mark_occupied(used_coords, max_a, max_b, 0, 0);
        return PositionResult {
            coord: VCoord { a: 0, b: 0, b_mod: 0 },
            call_stack_truncate_to: None,
        };
    };

    let mut a = last.a;
    let mut b = last.b;
    let mut b_mod = last.b_mod;
    let mut clash = 0u32;
    let mut truncate_to = None;

    // NonFlow falls through to Jump when the previous node was a taken
    // conditional (its taken target equals where we're going).
    let mut effective = input.last_rip_type;
    if effective == RipType::NonFlow {
        let falls_through_as_jump =
            input.last_conditional && input.last_cond_taken == Some(input.target_address);
        if !falls_through_as_jump {
            b_mod += BMULT;
            return finish(used_coords, max_a, max_b, a, b, b_mod, None);
        }
        effective = RipType::Jump;
    }

    match effective {
        RipType::AfterReturn => {
            a = (a - 20).min(-(*max_a + 2));
            b += 7 * BMULT;
        }
        RipType::Jump | RipType::ExceptionGenerator => {
            a += JUMPA;
            b += JUMPB * BMULT;
            while used_coords.contains(&(a, b)) {
                a += JUMPA_CLASH;
                clash += 1;
            }
            if clash > CLASH_WARN_THRESHOLD {
                warn!(clash, "dense graph clash (jump)");
            }
        }
        RipType::Call => {
            b += CALLB * BMULT;
            while used_coords.contains(&(a, b)) {
                a += CALLA_CLASH;
                b += CALLB_CLASH * BMULT;
                clash += 1;
            }
            if clash > 0 {
                a += CALLA_CLASH;
                if clash > CLASH_WARN_THRESHOLD {
                    warn!(clash, "dense graph clash (call)");
                }
            }
        }
        RipType::Return | RipType::External => {
            let hit = input
                .call_stack
                .iter()
                .enumerate()
                .find(|(_, &(pc, _))| pc == input.target_address);

            if let Some((idx, &(_, caller_idx))) = hit {
                let caller = nodes[caller_idx].vcoord;
                a = caller.a + RETURNA_OFFSET;
                b = caller.b + RETURNB_OFFSET;
                b_mod = caller.b_mod;
                truncate_to = Some(idx);
            } else {
                a += EXTERNA;
                b += EXTERNB * BMULT;
            }

            while used_coords.contains(&(a, b)) {
                a += JUMPA_CLASH;
                b += 1;
                clash += 1;
            }
            if clash > CLASH_WARN_THRESHOLD {
                warn!(clash, "dense graph clash (extern)");
            }
        }
        RipType::NonFlow | RipType::FirstInThread => unreachable!("handled above"),
    }

    finish(used_coords, max_a, max_b, a, b, b_mod, truncate_to)
}

fn finish(
    used_coords: &mut HashSet<(i64, i64)>,
    max_a: &mut i64,
    max_b: &mut i64,
    a: i64,
    b: i64,
    b_mod: i64,
    truncate_to: Option<usize>,
) -> PositionResult {
    mark_occupied(used_coords, max_a, max_b, a, b);
    PositionResult {
        coord: VCoord { a, b, b_mod },
        call_stack_truncate_to: truncate_to,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_input(rip: RipType, coord: Option<VCoord>) -> PositionInput {
        PositionInput {
            last_rip_type: rip,
            last_coord: coord,
            last_conditional: false,
            last_cond_taken: None,
            target_address: 0,
            call_stack: Vec::new(),
        }
    }

    #[test]
    fn first_in_thread_is_origin() {
        let mut used = HashSet::new();
        let mut max_a = 0;
        let mut max_b = 0;
        let input = base_input(RipType::FirstInThread, None);
        let result = position_vert(&[], &mut used, &mut max_a, &mut max_b, &input);
        assert_eq!(result.coord, VCoord { a: 0, b: 0, b_mod: 0 });
        assert!(used.contains(&(0, 0)));
    }

    #[test]
    fn nonflow_advances_bmod() {
        let mut used = HashSet::new();
        let mut max_a = 0;
        let mut max_b = 0;
        let input = base_input(
            RipType::NonFlow,
            Some(VCoord { a: 5, b: 5, b_mod: 2 }),
        );
        let result = position_vert(&[], &mut used, &mut max_a, &mut max_b, &input);
        assert_eq!(result.coord, VCoord { a: 5, b: 5, b_mod: 2 + BMULT });
    }

    #[test]
    fn jump_separates_diagonally() {
        let mut used = HashSet::new();
        let mut max_a = 0;
        let mut max_b = 0;
        let input = base_input(RipType::Jump, Some(VCoord { a: 0, b: 0, b_mod: 0 }));
        let result = position_vert(&[], &mut used, &mut max_a, &mut max_b, &input);
        assert_eq!(result.coord.a, JUMPA);
        assert_eq!(result.coord.b, JUMPB * BMULT);
    }

    #[test]
    fn jump_clash_shifts_a() {
        let mut used = HashSet::new();
        used.insert((JUMPA, JUMPB * BMULT));
        let mut max_a = 0;
        let mut max_b = 0;
        let input = base_input(RipType::Jump, Some(VCoord { a: 0, b: 0, b_mod: 0 }));
        let result = position_vert(&[], &mut used, &mut max_a, &mut max_b, &input);
        assert_eq!(result.coord.a, JUMPA + JUMPA_CLASH);
    }
}
