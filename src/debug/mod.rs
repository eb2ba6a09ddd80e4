use crate::chunk::{Chunk, OpCode};
use crate::heap::Heap;
use crate::object::{Handle, Obj, Value};

// ── Disassembler ─────────────────────────────────────────────────────
//
// Debug-only rendering of compiled chunks: `offset line mnemonic
// operand` per instruction. Drives `--dump` and trace-level execution
// logging; the VM itself never consumes this output.

pub fn disassemble_chunk(heap: &Heap, chunk: &Chunk, name: &str) -> String {
    let mut out = format!("== {name} ==\n");
    let mut offset = 0;
    while offset < chunk.code.len() {
        let (text, next) = disassemble_instruction(heap, chunk, offset);
        out.push_str(&text);
        out.push('\n');
        offset = next;
    }
    out
}

/// Disassembles the script function and, recursively, every function
/// nested in any constant pool.
pub fn disassemble_program(heap: &Heap, function: Handle) -> String {
    let f = heap.function(function);
    let name = heap.format_value(Value::Obj(function));
    let mut out = disassemble_chunk(heap, &f.chunk, &name);
    for &constant in &f.chunk.constants {
        if let Value::Obj(h) = constant {
            if let Obj::Function(_) = heap.get(h) {
                out.push('\n');
                out.push_str(&disassemble_program(heap, h));
            }
        }
    }
    out
}

/// Renders one instruction; returns the text and the next offset.
pub fn disassemble_instruction(heap: &Heap, chunk: &Chunk, offset: usize) -> (String, usize) {
    let mut text = format!("{offset:04} ");
    if offset > 0 && chunk.line_of(offset) == chunk.line_of(offset - 1) {
        text.push_str("   | ");
    } else {
        text.push_str(&format!("{:4} ", chunk.line_of(offset)));
    }

    let byte = chunk.code[offset];
    let op = match OpCode::from_byte(byte) {
        Some(op) => op,
        None => {
            text.push_str(&format!("unknown opcode {byte}"));
            return (text, offset + 1);
        }
    };

    match op {
        // No operand.
        OpCode::Nil
        | OpCode::True
        | OpCode::False
        | OpCode::Pop
        | OpCode::Equal
        | OpCode::Greater
        | OpCode::Less
        | OpCode::Add
        | OpCode::Subtract
        | OpCode::Multiply
        | OpCode::Divide
        | OpCode::Not
        | OpCode::Negate
        | OpCode::Print
        | OpCode::CloseUpvalue
        | OpCode::Return
        | OpCode::Inherit => {
            text.push_str(&format!("{op:?}"));
            (text, offset + 1)
        }

        // One-byte slot or count operand.
        OpCode::GetLocal
        | OpCode::SetLocal
        | OpCode::GetUpvalue
        | OpCode::SetUpvalue
        | OpCode::Call => {
            let operand = chunk.code[offset + 1];
            text.push_str(&format!("{:<16} {operand}", format!("{op:?}")));
            (text, offset + 2)
        }

        // One-byte constant operand, rendered inline.
        OpCode::Constant
        | OpCode::GetGlobal
        | OpCode::DefineGlobal
        | OpCode::SetGlobal
        | OpCode::GetProperty
        | OpCode::SetProperty
        | OpCode::GetSuper
        | OpCode::Class
        | OpCode::Method => {
            let idx = chunk.code[offset + 1] as usize;
            let rendered = heap.format_value(chunk.constants[idx]);
            text.push_str(&format!("{:<16} {idx} '{rendered}'", format!("{op:?}")));
            (text, offset + 2)
        }

        // Constant plus argument count.
        OpCode::Invoke | OpCode::SuperInvoke => {
            let idx = chunk.code[offset + 1] as usize;
            let arg_count = chunk.code[offset + 2];
            let rendered = heap.format_value(chunk.constants[idx]);
            text.push_str(&format!(
                "{:<16} ({arg_count} args) {idx} '{rendered}'",
                format!("{op:?}")
            ));
            (text, offset + 3)
        }

        // Two-byte big-endian displacement.
        OpCode::Jump | OpCode::JumpIfFalse | OpCode::Loop => {
            let distance =
                u16::from_be_bytes([chunk.code[offset + 1], chunk.code[offset + 2]]) as usize;
            let after = offset + 3;
            let target = if op == OpCode::Loop { after - distance } else { after + distance };
            text.push_str(&format!("{:<16} {offset} -> {target}", format!("{op:?}")));
            (text, after)
        }

        // Function constant followed by (is_local, index) capture pairs.
        OpCode::Closure => {
            let idx = chunk.code[offset + 1] as usize;
            let constant = chunk.constants[idx];
            let rendered = heap.format_value(constant);
            text.push_str(&format!("{:<16} {idx} {rendered}", format!("{op:?}")));
            let mut next = offset + 2;
            if let Value::Obj(h) = constant {
                let upvalue_count = heap.function(h).upvalue_count;
                for _ in 0..upvalue_count {
                    let is_local = chunk.code[next] != 0;
                    let index = chunk.code[next + 1];
                    let kind = if is_local { "local" } else { "upvalue" };
                    text.push_str(&format!("\n{next:04}    |   capture {kind} {index}"));
                    next += 2;
                }
            }
            (text, next)
        }
    }
}
