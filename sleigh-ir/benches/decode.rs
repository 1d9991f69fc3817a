use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use sleigh_bytes::Endian;
use sleigh_ir::space::SpaceKind;
use sleigh_ir::specification::{OperandSpec, PatternEquation, Statement, Value};
use sleigh_ir::{Opcode, Specification, SpecificationBuilder, Translator};

fn accumulator() -> Result<Specification, sleigh_ir::SpecificationError> {
    let mut builder = SpecificationBuilder::new("acc8", Endian::Little, 1);
    builder.default_space("ram", 2, 1)?;
    builder.space("register", SpaceKind::Register, 2, 1)?;
    builder.register("a", "register", 0, 1)?;
    builder.register("x", "register", 1, 1)?;

    builder.token("op", 8, Endian::Little)?;
    builder.field("op", "opcode", 4, 7, false, true)?;
    builder.field("op", "reg", 0, 0, false, false)?;
    builder.token("imm", 8, Endian::Little)?;
    builder.field("imm", "imm8", 0, 7, false, true)?;
    builder.attach_registers("reg", &[Some("a"), Some("x")])?;

    builder
        .constructor("instruction")
        .operand("reg", OperandSpec::symbol("reg"))
        .operand("imm", OperandSpec::symbol("imm8"))
        .pattern((PatternEquation::equal("opcode", 1) & PatternEquation::bind("reg")).cat(PatternEquation::bind("imm")))
        .print("ADDA reg, imm")
        .template(vec![Statement::op(
            Opcode::IntAdd,
            Some(Value::register("a")),
            vec![Value::operand("reg"), Value::operand("imm")],
        )])
        .finish()?;

    builder
        .constructor("instruction")
        .operand("reg", OperandSpec::symbol("reg"))
        .operand("imm", OperandSpec::symbol("imm8"))
        .pattern((PatternEquation::equal("opcode", 2) & PatternEquation::bind("reg")).cat(PatternEquation::bind("imm")))
        .print("LD reg, [imm]")
        .template(vec![Statement::copy(
            Value::operand("reg"),
            Value::deref("ram", Value::operand("imm"), 1),
        )])
        .finish()?;

    builder.build()
}

fn criterion_decode(c: &mut Criterion) {
    let spec = accumulator().expect("specification");
    let translator = Translator::new(Arc::new(spec)).expect("translator");
    let stream = [0x10, 0x05, 0x21, 0x80, 0x11, 0xff, 0x20, 0x10];

    c.bench_function("Translator::disassemble", |b| {
        b.iter(|| {
            let mut db = translator.context_database();
            let mut offset = 0;
            while offset < stream.len() {
                let insn = translator
                    .disassemble(&mut db, translator.address(offset as u64), &stream[offset..])
                    .expect("decode");
                offset += black_box(insn).length();
            }
        })
    });

    c.bench_function("Translator::lift_pcode", |b| {
        b.iter(|| {
            let mut db = translator.context_database();
            let mut offset = 0;
            while offset < stream.len() {
                let pcode = translator
                    .lift_pcode(&mut db, translator.address(offset as u64), &stream[offset..])
                    .expect("lift");
                offset += black_box(pcode).length();
            }
        })
    });
}

criterion_group!(benches, criterion_decode);
criterion_main!(benches);
