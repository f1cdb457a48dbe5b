use std::fmt::Write;

use glim_core::chunk::{Chunk, Function};
use glim_core::value::Value;

use crate::opcodes::Op;

fn read_u16(code: &[u8], offset: usize) -> u16 {
    ((code[offset] as u16) << 8) | code[offset + 1] as u16
}

fn op_name(op: Op) -> &'static str {
    match op {
        Op::Constant => "CONSTANT",
        Op::Nil => "NIL",
        Op::True => "TRUE",
        Op::False => "FALSE",
        Op::Pop => "POP",
        Op::Not => "NOT",
        Op::Negate => "NEGATE",
        Op::Equal => "EQUAL",
        Op::Greater => "GREATER",
        Op::Less => "LESS",
        Op::Add => "ADD",
        Op::Subtract => "SUBTRACT",
        Op::Multiply => "MULTIPLY",
        Op::Divide => "DIVIDE",
        Op::Print => "PRINT",
        Op::DefineGlobal => "DEFINE_GLOBAL",
        Op::GetGlobal => "GET_GLOBAL",
        Op::SetGlobal => "SET_GLOBAL",
        Op::GetLocal => "GET_LOCAL",
        Op::SetLocal => "SET_LOCAL",
        Op::GetUpvalue => "GET_UPVALUE",
        Op::SetUpvalue => "SET_UPVALUE",
        Op::CloseUpvalue => "CLOSE_UPVALUE",
        Op::Jump => "JUMP",
        Op::JumpIfFalse => "JUMP_IF_FALSE",
        Op::Loop => "LOOP",
        Op::Call => "CALL",
        Op::Closure => "CLOSURE",
        Op::Class => "CLASS",
        Op::GetProperty => "GET_PROPERTY",
        Op::SetProperty => "SET_PROPERTY",
        Op::Method => "METHOD",
        Op::Return => "RETURN",
    }
}

/// Render one instruction; returns the text and the offset of the next
/// instruction.
pub fn disassemble_instruction(chunk: &Chunk, offset: usize) -> (String, usize) {
    let mut text = format!("{offset:04} ");
    if offset > 0 && chunk.lines[offset] == chunk.lines[offset - 1] {
        text.push_str("   | ");
    } else {
        let _ = write!(text, "{:4} ", chunk.lines[offset]);
    }

    let byte = chunk.code[offset];
    let Some(op) = Op::from_u8(byte) else {
        let _ = write!(text, "UNKNOWN({byte:#04x})");
        return (text, offset + 1);
    };

    match op {
        // Constant operand.
        Op::Constant
        | Op::DefineGlobal
        | Op::GetGlobal
        | Op::SetGlobal
        | Op::Class
        | Op::GetProperty
        | Op::SetProperty
        | Op::Method => {
            let index = chunk.code[offset + 1];
            let _ = write!(
                text,
                "{:<16} {index:4} '{}'",
                op_name(op),
                chunk.constants[index as usize]
            );
            (text, offset + 2)
        }

        // Slot / count operand.
        Op::GetLocal | Op::SetLocal | Op::GetUpvalue | Op::SetUpvalue | Op::Call => {
            let operand = chunk.code[offset + 1];
            let _ = write!(text, "{:<16} {operand:4}", op_name(op));
            (text, offset + 2)
        }

        // Forward jumps.
        Op::Jump | Op::JumpIfFalse => {
            let jump = read_u16(&chunk.code, offset + 1) as usize;
            let target = offset + 3 + jump;
            let _ = write!(text, "{:<16} {offset:4} -> {target}", op_name(op));
            (text, offset + 3)
        }

        // Backward jump.
        Op::Loop => {
            let jump = read_u16(&chunk.code, offset + 1) as usize;
            let target = offset + 3 - jump;
            let _ = write!(text, "{:<16} {offset:4} -> {target}", op_name(op));
            (text, offset + 3)
        }

        // Function constant plus one (is_local, index) pair per upvalue.
        Op::Closure => {
            let index = chunk.code[offset + 1] as usize;
            let constant = &chunk.constants[index];
            let _ = write!(text, "{:<16} {index:4} {constant}", op_name(op));
            let mut next = offset + 2;
            if let Value::Function(function) = constant {
                for _ in 0..function.upvalue_count {
                    let is_local = chunk.code[next];
                    let slot = chunk.code[next + 1];
                    let kind = if is_local != 0 { "local" } else { "upvalue" };
                    let _ = write!(text, "\n{next:04}    |   {kind} {slot}");
                    next += 2;
                }
            }
            (text, next)
        }

        _ => {
            text.push_str(op_name(op));
            (text, offset + 1)
        }
    }
}

/// Produce a human-readable disassembly of a chunk.
pub fn disassemble(chunk: &Chunk, name: &str) -> String {
    let mut out = String::new();
    let label = if name.is_empty() { "<script>" } else { name };
    let _ = writeln!(out, "== {label} ==");

    let mut offset = 0;
    while offset < chunk.code.len() {
        let (text, next) = disassemble_instruction(chunk, offset);
        let _ = writeln!(out, "{text}");
        offset = next;
    }
    out
}

/// Disassemble a function and, recursively, every function nested in its
/// constant pool.
pub fn disassemble_program(function: &Function) -> String {
    let mut out = disassemble(&function.chunk, &function.name);
    for constant in &function.chunk.constants {
        if let Value::Function(nested) = constant {
            out.push('\n');
            out.push_str(&disassemble_program(nested));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;

    #[test]
    fn simple_chunk_listing() {
        let function = compile("print 1 + 2;").unwrap();
        let listing = disassemble(&function.chunk, &function.name);
        assert!(listing.starts_with("== <script> =="));
        assert!(listing.contains("CONSTANT"));
        assert!(listing.contains("ADD"));
        assert!(listing.contains("PRINT"));
        assert!(listing.contains("RETURN"));
    }

    #[test]
    fn jump_targets_are_absolute() {
        let function = compile("if (true) print 1;").unwrap();
        let listing = disassemble(&function.chunk, &function.name);
        assert!(listing.contains("JUMP_IF_FALSE"));
        assert!(listing.contains("->"));
    }

    #[test]
    fn closure_lists_upvalue_captures() {
        let function = compile("{ var x = 1; fun f() { print x; } }").unwrap();
        let listing = disassemble_program(&function);
        assert!(listing.contains("CLOSURE"));
        assert!(listing.contains("local 1"));
        // The nested function gets its own section.
        assert!(listing.contains("== f =="));
        assert!(listing.contains("GET_UPVALUE"));
    }

    #[test]
    fn listing_walks_every_instruction() {
        let function = compile("var a = 1; while (a < 10) a = a + 1;").unwrap();
        let mut offset = 0;
        while offset < function.chunk.code.len() {
            let (_, next) = disassemble_instruction(&function.chunk, offset);
            assert!(next > offset);
            offset = next;
        }
        assert_eq!(offset, function.chunk.code.len());
    }
}
