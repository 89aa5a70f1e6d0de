//! Flat body -> block tree translation.
//!
//! The data model keeps function bodies flat (so binaries round-trip byte
//! for byte); the interpreter executes a tree in which each `block`,
//! `loop`, and `if` owns its body. Translation happens at call time and is
//! memoised per function when the execution policy enables the translation
//! cache.

use super::RuntimeError;
use crate::parser::instruction::{BlockType, Instruction};

/// One node of a structured body.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockNode {
    Plain(Instruction),
    Block {
        block_type: BlockType,
        body: Vec<BlockNode>,
    },
    Loop {
        block_type: BlockType,
        body: Vec<BlockNode>,
    },
    If {
        block_type: BlockType,
        then_body: Vec<BlockNode>,
        else_body: Vec<BlockNode>,
    },
}

/// A function body translated for execution.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredBody {
    pub body: Vec<BlockNode>,
}

/// Translates a flat instruction sequence (terminated by `end`) into a
/// block tree.
pub fn build(instructions: &[Instruction]) -> Result<StructuredBody, RuntimeError> {
    let mut pos = 0;
    let body = build_sequence(instructions, &mut pos, SequenceEnd::FunctionEnd)?.0;
    if pos != instructions.len() {
        return Err(RuntimeError::MalformedBody(format!(
            "trailing instructions after function end at {pos}"
        )));
    }
    Ok(StructuredBody { body })
}

/// What terminated a sequence.
#[derive(Debug, PartialEq, Eq)]
enum Terminator {
    End,
    Else,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SequenceEnd {
    FunctionEnd,
    BlockEnd,
    ThenEnd,
}

fn build_sequence(
    instructions: &[Instruction],
    pos: &mut usize,
    kind: SequenceEnd,
) -> Result<(Vec<BlockNode>, Terminator), RuntimeError> {
    let mut nodes = Vec::new();

    while let Some(instruction) = instructions.get(*pos) {
        *pos += 1;
        match instruction {
            Instruction::Block { block_type } => {
                let (body, terminator) = build_sequence(instructions, pos, SequenceEnd::BlockEnd)?;
                if terminator != Terminator::End {
                    return Err(RuntimeError::MalformedBody("else terminating a block".to_string()));
                }
                nodes.push(BlockNode::Block {
                    block_type: *block_type,
                    body,
                });
            }
            Instruction::Loop { block_type } => {
                let (body, terminator) = build_sequence(instructions, pos, SequenceEnd::BlockEnd)?;
                if terminator != Terminator::End {
                    return Err(RuntimeError::MalformedBody("else terminating a loop".to_string()));
                }
                nodes.push(BlockNode::Loop {
                    block_type: *block_type,
                    body,
                });
            }
            Instruction::If { block_type } => {
                let (then_body, terminator) = build_sequence(instructions, pos, SequenceEnd::ThenEnd)?;
                let else_body = if terminator == Terminator::Else {
                    let (body, terminator) = build_sequence(instructions, pos, SequenceEnd::BlockEnd)?;
                    if terminator != Terminator::End {
                        return Err(RuntimeError::MalformedBody("else after else".to_string()));
                    }
                    body
                } else {
                    Vec::new()
                };
                nodes.push(BlockNode::If {
                    block_type: *block_type,
                    then_body,
                    else_body,
                });
            }
            Instruction::End => return Ok((nodes, Terminator::End)),
            Instruction::Else => {
                if kind != SequenceEnd::ThenEnd {
                    return Err(RuntimeError::MalformedBody("else outside if".to_string()));
                }
                return Ok((nodes, Terminator::Else));
            }
            plain => nodes.push(BlockNode::Plain(plain.clone())),
        }
    }

    Err(RuntimeError::MalformedBody(format!(
        "missing end terminator ({kind:?})"
    )))
}
