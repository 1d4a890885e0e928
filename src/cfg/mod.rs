//! Control flow structuring
//!
//! This module turns a prototype's flat instruction stream into a nested tree
//! of control-construct [`Block`]s. The instruction-level jump graph is kept
//! in a `petgraph` graph; the structurer in [`builder`] walks it range by
//! range.

pub mod block;
pub mod builder;
pub mod chain;

pub use block::{Block, BlockKind, ForBlock, IfBlock, WhileBlock};
pub use builder::{structure, BlockStructurer};

use crate::chunk::Instruction;
use crate::error::{Error, Result};
use petgraph::dot::{Config, Dot};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, EdgeRef};
use petgraph::Direction;
use std::collections::BTreeSet;

/// Edge kind in the jump graph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    /// Fallthrough to the next instruction
    Fall,
    /// A test skipping the jump that follows it
    Skip,
    /// Forward jump
    Jump,
    /// Backward `Jmp`
    Back,
    /// `ForLoop`/`TForLoop` returning to the loop body
    Iterate,
    /// Function exit
    Exit,
}

/// Instruction-level control flow graph of one prototype.
///
/// Node `pc` stands for instruction `pc`; one extra node represents the exit.
pub struct JumpGraph {
    graph: DiGraph<usize, EdgeKind>,
    nodes: Vec<NodeIndex>,
    exit: NodeIndex,
}

impl JumpGraph {
    /// Build the graph, rejecting jumps that leave the instruction array.
    pub fn build(code: &[Instruction]) -> Result<Self> {
        let mut graph = DiGraph::new();
        let nodes: Vec<NodeIndex> = (0..code.len()).map(|pc| graph.add_node(pc)).collect();
        let exit = graph.add_node(code.len());
        let node_at = |pc: usize| if pc < nodes.len() { nodes[pc] } else { exit };

        for (pc, instruction) in code.iter().enumerate() {
            let here = nodes[pc];
            if matches!(instruction, Instruction::Return { .. } | Instruction::TailCall { .. }) {
                graph.add_edge(here, exit, EdgeKind::Exit);
                continue;
            }
            if instruction.is_test() {
                if pc + 2 > code.len() {
                    return Err(Error::structural(pc, "test has no instruction to skip"));
                }
                graph.add_edge(here, node_at(pc + 1), EdgeKind::Fall);
                graph.add_edge(here, node_at(pc + 2), EdgeKind::Skip);
                continue;
            }
            if instruction.jump_offset().is_none() {
                graph.add_edge(here, node_at(pc + 1), EdgeKind::Fall);
                continue;
            }

            let target = instruction
                .jump_target(pc)
                .filter(|target| *target < code.len())
                .ok_or_else(|| {
                    Error::structural(pc, format!("{} target is outside the function", instruction.name()))
                })?;
            match instruction {
                Instruction::Jmp { .. } => {
                    let kind = if target <= pc { EdgeKind::Back } else { EdgeKind::Jump };
                    graph.add_edge(here, nodes[target], kind);
                }
                Instruction::ForLoop { .. } | Instruction::TForLoop { .. } => {
                    graph.add_edge(here, nodes[target], EdgeKind::Iterate);
                    graph.add_edge(here, node_at(pc + 1), EdgeKind::Fall);
                }
                _ => {
                    graph.add_edge(here, nodes[target], EdgeKind::Jump);
                    graph.add_edge(here, node_at(pc + 1), EdgeKind::Fall);
                }
            }
        }

        Ok(Self { graph, nodes, exit })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Jump target of the instruction at `pc`, if it has one.
    pub fn target(&self, pc: usize) -> Option<usize> {
        let node = *self.nodes.get(pc)?;
        self.graph
            .edges_directed(node, Direction::Outgoing)
            .find(|edge| {
                matches!(
                    edge.weight(),
                    EdgeKind::Jump | EdgeKind::Back | EdgeKind::Iterate
                )
            })
            .map(|edge| self.graph[edge.target()])
    }

    /// Sources of backward `Jmp`s landing on `pc`, in ascending order.
    pub fn back_jumps_to(&self, pc: usize) -> Vec<usize> {
        let Some(&node) = self.nodes.get(pc) else {
            return Vec::new();
        };
        let mut sources: Vec<usize> = self
            .graph
            .edges_directed(node, Direction::Incoming)
            .filter(|edge| *edge.weight() == EdgeKind::Back)
            .map(|edge| self.graph[edge.source()])
            .collect();
        sources.sort_unstable();
        sources
    }

    /// Targets of backward `Jmp`s.
    pub fn loop_heads(&self) -> BTreeSet<usize> {
        self.graph
            .edge_references()
            .filter(|edge| *edge.weight() == EdgeKind::Back)
            .map(|edge| self.graph[edge.target()])
            .collect()
    }

    /// Instructions not reachable from the entry.
    pub fn unreachable(&self) -> Vec<usize> {
        let Some(&entry) = self.nodes.first() else {
            return Vec::new();
        };
        let mut seen = vec![false; self.nodes.len()];
        let mut dfs = Dfs::new(&self.graph, entry);
        while let Some(node) = dfs.next(&self.graph) {
            if node != self.exit {
                seen[self.graph[node]] = true;
            }
        }
        seen.iter()
            .enumerate()
            .filter(|(_, seen)| !**seen)
            .map(|(pc, _)| pc)
            .collect()
    }

    /// Export the graph in DOT format
    pub fn to_dot(&self) -> String {
        format!(
            "{:?}",
            Dot::with_config(&self.graph, &[Config::EdgeNoLabel])
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Instruction::*;

    #[test]
    fn test_back_jumps_and_targets() {
        let code = vec![
            Test { a: 0, k: false },
            Jmp { offset: 2 },
            Move { a: 1, b: 0 },
            Jmp { offset: -4 },
            Return { a: 0, count: Some(0) },
        ];
        let graph = JumpGraph::build(&code).unwrap();
        assert_eq!(graph.len(), 5);
        assert_eq!(graph.target(1), Some(4));
        assert_eq!(graph.target(3), Some(0));
        assert_eq!(graph.target(2), None);
        assert_eq!(graph.back_jumps_to(0), vec![3]);
        assert!(graph.back_jumps_to(1).is_empty());
        assert_eq!(graph.loop_heads().into_iter().collect::<Vec<_>>(), vec![0]);
        assert!(graph.unreachable().is_empty());
    }

    #[test]
    fn test_out_of_range_jump_is_rejected() {
        let code = vec![Jmp { offset: 5 }, Return { a: 0, count: Some(0) }];
        let err = JumpGraph::build(&code).err().unwrap();
        assert_eq!(err.pc(), Some(0));
    }

    #[test]
    fn test_dead_code_after_return() {
        let code = vec![
            Return { a: 0, count: Some(0) },
            Move { a: 0, b: 1 },
            Return { a: 0, count: Some(0) },
        ];
        let graph = JumpGraph::build(&code).unwrap();
        assert_eq!(graph.unreachable(), vec![1, 2]);
        assert!(graph.to_dot().contains("digraph"));
    }
}
