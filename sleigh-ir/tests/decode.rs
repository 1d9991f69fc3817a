use std::sync::Arc;

use sleigh_bytes::Endian;
use sleigh_ir::disassembly::PatternExpression;
use sleigh_ir::space::SpaceKind;
use sleigh_ir::specification::{OperandSpec, PatternEquation, Statement, Value};
use sleigh_ir::{Address, Error, Opcode, SpecificationBuilder, Translator};

fn toy() -> anyhow::Result<Translator> {
    let mut builder = SpecificationBuilder::new("toy16", Endian::Big, 1);
    builder.default_space("ram", 4, 1)?;
    builder.space("register", SpaceKind::Register, 4, 1)?;

    builder.token("instr", 16, Endian::Big)?;
    builder.field("instr", "op", 12, 15, false, true)?;
    builder.field("instr", "sub", 8, 11, false, true)?;
    builder.field("instr", "reg", 0, 3, false, false)?;
    builder.field("instr", "imm8", 0, 7, false, true)?;

    builder.token("ext", 8, Endian::Big)?;
    builder.field("ext", "kind", 6, 7, false, false)?;
    builder.field("ext", "val", 0, 5, false, true)?;
    builder.field("ext", "byte", 0, 7, false, true)?;

    builder.context_field("addrsize", 0, 1, false, true)?;
    builder.context_field("mode", 2, 2, false, false)?;
    builder.context_default("addrsize", 1)?;

    for i in 0..4 {
        builder.register(&format!("r{}", i), "register", i * 4, 4)?;
    }
    builder.register("pc", "register", 0x40, 4)?;
    builder.program_counter("pc")?;
    builder.attach_registers("reg", &[Some("r0"), Some("r1"), Some("r2"), Some("r3")])?;
    builder.subtable("src")?;

    builder
        .constructor("src")
        .operand("val", OperandSpec::symbol("val"))
        .pattern(PatternEquation::equal("kind", 0) & PatternEquation::bind("val"))
        .print("#val")
        .template(vec![
            Statement::copy(Value::temporary(0, 4), Value::operand("val")),
            Statement::Export(Value::temporary(0, 4)),
        ])
        .finish()?;

    builder
        .constructor("src")
        .operand("ext", OperandSpec::symbol("byte"))
        .pattern(PatternEquation::equal("kind", 1).cat(PatternEquation::bind("ext")))
        .print("[ext]")
        .template(vec![Statement::Export(Value::deref("ram", Value::operand("ext"), 4))])
        .finish()?;

    builder
        .constructor("instruction")
        .operand("reg", OperandSpec::symbol("reg"))
        .pattern(PatternEquation::equal("op", 1) & PatternEquation::equal("sub", 0) & PatternEquation::bind("reg"))
        .print("MOV reg")
        .template(vec![Statement::copy(Value::operand("reg"), Value::constant(0, 4))])
        .finish()?;

    builder
        .constructor("instruction")
        .pattern(PatternEquation::equal("op", 2))
        .print("SETA")
        .context_set("addrsize", PatternExpression::constant(2))
        .global_set("inst_next", "addrsize")
        .template(Vec::new())
        .finish()?;

    builder
        .constructor("instruction")
        .pattern(PatternEquation::equal("op", 3))
        .print("SETM")
        .context_set("mode", PatternExpression::constant(1))
        .global_set("inst_next", "mode")
        .template(Vec::new())
        .finish()?;

    for (mnemonic, pattern) in [
        ("LDM", PatternEquation::equal("op", 4) & PatternEquation::equal("mode", 1)),
        ("LD8", PatternEquation::equal("op", 4) & PatternEquation::equal("addrsize", 2)),
        ("LD4", PatternEquation::equal("op", 4)),
    ] {
        builder
            .constructor("instruction")
            .pattern(pattern)
            .print(mnemonic)
            .template(Vec::new())
            .finish()?;
    }

    builder
        .constructor("instruction")
        .operand("reg", OperandSpec::symbol("reg"))
        .operand("src", OperandSpec::symbol("src"))
        .pattern((PatternEquation::equal("op", 5) & PatternEquation::bind("reg")).cat(PatternEquation::bind("src")))
        .print("ADD reg, src")
        .template(vec![
            Statement::build("src"),
            Statement::op(
                Opcode::IntAdd,
                Some(Value::operand("reg")),
                vec![Value::operand("reg"), Value::operand("src")],
            ),
        ])
        .finish()?;

    builder
        .constructor("instruction")
        .pattern(PatternEquation::equal("op", 6))
        .print("BRD")
        .template(vec![
            Statement::DelaySlot(2),
            Statement::op(
                Opcode::Branch,
                None,
                vec![Value::memory("ram", Value::constant(0x2000, 4), 4)],
            ),
        ])
        .finish()?;

    builder
        .constructor("instruction")
        .pattern(PatternEquation::equal("op", 8))
        .print("SKIP")
        .template(vec![
            Statement::op(Opcode::CBranch, None, vec![Value::Label(0), Value::constant(1, 1)]),
            Statement::copy(Value::register("r0"), Value::constant(0, 4)),
            Statement::Label(0),
        ])
        .finish()?;

    let divide = builder.constructor("instruction");
    let quotient = divide.value("imm8")? / divide.value("reg")?;
    divide
        .operand("q", OperandSpec::Expression(quotient))
        .pattern(PatternEquation::equal("op", 9))
        .print("DIV q")
        .template(Vec::new())
        .finish()?;

    builder
        .constructor("instruction")
        .pattern(PatternEquation::equal("op", 9))
        .print("DIVZ")
        .template(Vec::new())
        .finish()?;

    builder
        .constructor("instruction")
        .operand("src", OperandSpec::symbol("src"))
        .pattern(PatternEquation::equal("op", 10).cat(PatternEquation::bind("src")))
        .print("SETX src")
        .context_set("addrsize", PatternExpression::constant(3))
        .global_set("inst_next", "addrsize")
        .template(vec![Statement::build("src")])
        .finish()?;

    builder
        .constructor("instruction")
        .operand("reg", OperandSpec::symbol("reg"))
        .operand("a", OperandSpec::symbol("src"))
        .operand("b", OperandSpec::symbol("src"))
        .pattern(
            (PatternEquation::equal("op", 7) & PatternEquation::bind("reg"))
                .cat(PatternEquation::bind("a"))
                .cat(PatternEquation::bind("b")),
        )
        .print("ADD2 reg, a, b")
        .template(vec![
            Statement::build("a"),
            Statement::build("b"),
            Statement::op(
                Opcode::IntAdd,
                Some(Value::operand("reg")),
                vec![Value::operand("a"), Value::operand("b")],
            ),
        ])
        .finish()?;

    builder
        .constructor("instruction")
        .pattern(PatternEquation::equal("op", 11))
        .print("BRS")
        .context_set("addrsize", PatternExpression::constant(2))
        .global_set("inst_next", "addrsize")
        .template(vec![
            Statement::DelaySlot(2),
            Statement::op(
                Opcode::Branch,
                None,
                vec![Value::memory("ram", Value::constant(0x2000, 4), 4)],
            ),
        ])
        .finish()?;

    // TRYA sets `mode` before its operand fails to match; TRYB prints it
    builder
        .constructor("instruction")
        .operand("src", OperandSpec::symbol("src"))
        .pattern(PatternEquation::equal("op", 12).cat(PatternEquation::bind("src")))
        .print("TRYA src")
        .context_set("mode", PatternExpression::constant(1))
        .template(Vec::new())
        .finish()?;

    builder
        .constructor("instruction")
        .operand("m", OperandSpec::symbol("mode"))
        .pattern(PatternEquation::equal("op", 12))
        .print("TRYB m")
        .template(Vec::new())
        .finish()?;

    Ok(Translator::new(Arc::new(builder.build()?))?)
}

fn text(translator: &Translator, db: &mut sleigh_ir::ContextDatabase, address: u64, bytes: &[u8]) -> anyhow::Result<String> {
    let insn = translator.disassemble(db, translator.address(address), bytes)?;
    Ok(if insn.body().is_empty() {
        insn.mnemonic().to_owned()
    } else {
        format!("{} {}", insn.mnemonic(), insn.body())
    })
}

#[test]
fn move_register() -> anyhow::Result<()> {
    let _ = env_logger::try_init();

    let translator = toy()?;
    let mut db = translator.context_database();

    let insn = translator.disassemble(&mut db, translator.address(0x1000), &[0x10, 0x00])?;
    assert_eq!(insn.mnemonic(), "MOV");
    assert_eq!(insn.body(), "r0");
    assert_eq!(insn.length(), 2);

    let pcode = translator.lift_pcode(&mut db, translator.address(0x1000), &[0x10, 0x00])?;
    assert_eq!(pcode.length(), 2);
    assert_eq!(pcode.operations().len(), 1);

    let copy = &pcode.operations()[0];
    assert_eq!(copy.opcode(), Opcode::Copy);
    let output = copy.output().unwrap();
    assert!(output.space().is_register());
    assert_eq!((output.offset(), output.size()), (0, 4));
    assert!(copy.inputs()[0].space().is_constant());
    assert_eq!(pcode.display(&translator).to_string(), "0x1000.00: COPY(out=r0, in=[0x0:4])");
    Ok(())
}

#[test]
fn unmatched_bytes_are_bad_data() -> anyhow::Result<()> {
    let translator = toy()?;
    let mut db = translator.context_database();

    for bytes in [&[0xf0, 0x00][..], &[0x10, 0x05], &[0x10, 0x10], &[0x10]] {
        let result = translator.disassemble(&mut db, translator.address(0x1000), bytes);
        assert!(matches!(result, Err(Error::BadData { address: 0x1000 })), "{:02x?}", bytes);

        let result = translator.lift_pcode(&mut db, translator.address(0x1000), bytes);
        assert!(matches!(result, Err(Error::BadData { .. })));
    }
    Ok(())
}

#[test]
fn flowing_context() -> anyhow::Result<()> {
    let translator = toy()?;
    let mut db = translator.context_database();

    assert_eq!(text(&translator, &mut db, 0x1000, &[0x20, 0x00])?, "SETA");
    assert_eq!(text(&translator, &mut db, 0x1002, &[0x40, 0x00])?, "LD8");
    assert_eq!(text(&translator, &mut db, 0x1010, &[0x40, 0x00])?, "LD8");
    assert_eq!(text(&translator, &mut db, 0x0800, &[0x40, 0x00])?, "LD4");

    let mut fresh = translator.context_database();
    assert_eq!(text(&translator, &mut fresh, 0x2000, &[0x40, 0x00])?, "LD4");
    Ok(())
}

#[test]
fn non_flowing_context_does_not_leak() -> anyhow::Result<()> {
    let translator = toy()?;
    let mut db = translator.context_database();

    assert_eq!(text(&translator, &mut db, 0x3000, &[0x30, 0x00])?, "SETM");
    assert_eq!(text(&translator, &mut db, 0x3002, &[0x40, 0x00])?, "LDM");
    assert_eq!(text(&translator, &mut db, 0x3004, &[0x40, 0x00])?, "LD4");
    Ok(())
}

#[test]
fn nested_subtables() -> anyhow::Result<()> {
    let translator = toy()?;
    let mut db = translator.context_database();

    let immediate = translator.disassemble(&mut db, translator.address(0), &[0x50, 0x01, 0x05])?;
    assert_eq!(immediate.body(), "r1, #0x5");
    assert_eq!(immediate.length(), 3);

    let pcode = translator.lift_pcode(&mut db, translator.address(0), &[0x50, 0x01, 0x05])?;
    let opcodes = pcode.operations().iter().map(|op| op.opcode()).collect::<Vec<_>>();
    assert_eq!(opcodes, vec![Opcode::Copy, Opcode::IntAdd]);

    let temporary = pcode.operations()[0].output().unwrap();
    assert!(temporary.space().is_unique());
    assert_eq!(pcode.operations()[1].inputs()[1], *temporary);

    let memory = translator.disassemble(&mut db, translator.address(0), &[0x50, 0x02, 0x40, 0x20])?;
    assert_eq!(memory.body(), "r2, [0x20]");
    assert_eq!(memory.length(), 4);

    let pcode = translator.lift_pcode(&mut db, translator.address(0), &[0x50, 0x02, 0x40, 0x20])?;
    assert_eq!(pcode.operations().len(), 1);
    let loaded = &pcode.operations()[0].inputs()[1];
    assert_eq!(loaded.space().name(), "ram");
    assert_eq!((loaded.offset(), loaded.size()), (0x20, 4));
    Ok(())
}

#[test]
fn delay_slot_splice() -> anyhow::Result<()> {
    let translator = toy()?;
    let mut db = translator.context_database();
    let bytes = [0x60, 0x00, 0x10, 0x01];

    let pcode = translator.lift_pcode(&mut db, translator.address(0x400), &bytes)?;
    let opcodes = pcode.operations().iter().map(|op| op.opcode()).collect::<Vec<_>>();
    assert_eq!(opcodes, vec![Opcode::Copy, Opcode::Branch]);
    assert_eq!(pcode.operations()[0].output().map(|v| v.offset()), Some(4));
    assert_eq!(pcode.delay_slots(), 2);
    assert_eq!(pcode.length(), 2);

    let slot = translator.disassemble(&mut db, translator.address(0x402), &bytes[2..])?;
    assert_eq!((slot.mnemonic(), slot.body()), ("MOV", "r1"));

    let mut bounded = translator.clone();
    bounded.set_max_delay_depth(0);
    let overflow = bounded.lift_pcode(&mut db, translator.address(0x400), &bytes);
    assert!(matches!(overflow, Err(Error::DelaySlotOverflow(0))));

    let truncated = translator.lift_pcode(&mut db, translator.address(0x400), &bytes[..2]);
    assert!(matches!(truncated, Err(Error::BadData { address: 0x402 })));
    Ok(())
}

#[test]
fn sibling_subtables_keep_separate_temporaries() -> anyhow::Result<()> {
    let translator = toy()?;
    let mut db = translator.context_database();
    let bytes = [0x70, 0x01, 0x05, 0x07];

    assert_eq!(text(&translator, &mut db, 0, &bytes)?, "ADD2 r1, #0x5, #0x7");

    let pcode = translator.lift_pcode(&mut db, translator.address(0), &bytes)?;
    let ops = pcode.operations();
    let opcodes = ops.iter().map(|op| op.opcode()).collect::<Vec<_>>();
    assert_eq!(opcodes, vec![Opcode::Copy, Opcode::Copy, Opcode::IntAdd]);

    let first = ops[0].output().unwrap();
    let second = ops[1].output().unwrap();
    assert!(first.space().is_unique() && second.space().is_unique());
    assert_ne!(first, second);

    assert_eq!((ops[0].inputs()[0].offset(), ops[1].inputs()[0].offset()), (5, 7));
    assert_eq!(ops[2].inputs()[0], *first);
    assert_eq!(ops[2].inputs()[1], *second);
    Ok(())
}

#[test]
fn failed_delay_slots_discard_context_commits() -> anyhow::Result<()> {
    let translator = toy()?;
    let mut db = translator.context_database();
    let slot = Address::from(0x102u64);

    let failed = translator.lift_pcode(&mut db, translator.address(0x100), &[0xb0, 0x00, 0xf0, 0x00]);
    assert!(matches!(failed, Err(Error::BadData { address: 0x102 })));
    assert_eq!(db.get_variable("addrsize", slot), Some(1));

    let mut bounded = translator.clone();
    bounded.set_max_delay_depth(0);
    let overflow = bounded.lift_pcode(&mut db, translator.address(0x100), &[0xb0, 0x00, 0x10, 0x01]);
    assert!(matches!(overflow, Err(Error::DelaySlotOverflow(0))));
    assert_eq!(db.get_variable("addrsize", slot), Some(1));

    let pcode = translator.lift_pcode(&mut db, translator.address(0x100), &[0xb0, 0x00, 0x10, 0x01])?;
    assert_eq!(pcode.delay_slots(), 2);
    assert_eq!(db.get_variable("addrsize", slot), Some(2));
    assert_eq!(text(&translator, &mut db, 0x104, &[0x40, 0x00])?, "LD8");
    Ok(())
}

#[test]
fn failed_operands_fall_back_to_later_constructors() -> anyhow::Result<()> {
    let translator = toy()?;
    let mut db = translator.context_database();

    assert_eq!(text(&translator, &mut db, 0, &[0xc0, 0x00, 0x05])?, "TRYA #0x5");
    assert_eq!(text(&translator, &mut db, 0, &[0xc0, 0x00, 0x80])?, "TRYB 0x0");

    let pcode = translator.lift_pcode(&mut db, translator.address(0), &[0xc0, 0x00, 0x80])?;
    assert_eq!(pcode.length(), 2);
    assert!(pcode.operations().is_empty());
    Ok(())
}

#[test]
fn forward_labels() -> anyhow::Result<()> {
    let translator = toy()?;
    let mut db = translator.context_database();

    let pcode = translator.lift_pcode(&mut db, translator.address(0), &[0x80, 0x00])?;
    assert_eq!(pcode.operations().len(), 2);

    let branch = &pcode.operations()[0];
    assert_eq!(branch.opcode(), Opcode::CBranch);
    assert!(branch.inputs()[0].space().is_constant());
    assert_eq!(branch.inputs()[0].offset(), 2);
    Ok(())
}

#[test]
fn division_by_zero_rejects_candidate() -> anyhow::Result<()> {
    let translator = toy()?;
    let mut db = translator.context_database();

    assert_eq!(text(&translator, &mut db, 0, &[0x90, 0x42])?, "DIV 0x21");
    assert_eq!(text(&translator, &mut db, 0, &[0x90, 0x40])?, "DIVZ");
    Ok(())
}

#[test]
fn failed_decodes_leave_context_untouched() -> anyhow::Result<()> {
    let translator = toy()?;
    let mut db = translator.context_database();

    let failed = translator.disassemble(&mut db, translator.address(0x1000), &[0xa0, 0x00, 0x80]);
    assert!(matches!(failed, Err(Error::BadData { .. })));
    assert_eq!(text(&translator, &mut db, 0x1003, &[0x40, 0x00])?, "LD4");

    assert_eq!(text(&translator, &mut db, 0x1000, &[0xa0, 0x00, 0x05])?, "SETX #0x5");
    assert_eq!(db.get_variable("addrsize", Address::from(0x1003u64)), Some(3));
    Ok(())
}

#[test]
fn decoding_is_deterministic_and_consistent() -> anyhow::Result<()> {
    let translator = toy()?;
    let stream = [
        0x10, 0x00, 0x50, 0x01, 0x05, 0x60, 0x00, 0x10, 0x02, 0x80, 0x00, 0x50, 0x03, 0x40, 0x20,
    ];

    let mut first = Vec::new();
    for _ in 0..2 {
        let mut db = translator.context_database();
        let mut offset = 0;
        let mut lines = Vec::new();

        while offset < stream.len() {
            let address = translator.address(offset as u64);
            let insn = translator.disassemble(&mut db, address.clone(), &stream[offset..])?;
            let pcode = translator.lift_pcode(&mut db, address, &stream[offset..])?;

            assert!(insn.length() > 0);
            assert_eq!(insn.length(), pcode.length());

            lines.push(insn.to_string());
            offset += insn.length();
        }

        assert_eq!(offset, stream.len());
        if first.is_empty() {
            first = lines;
        } else {
            assert_eq!(first, lines);
        }
    }

    assert_eq!(first[0], "0x0 MOV r0");
    assert_eq!(first.len(), 6);
    Ok(())
}

fn sectioned() -> anyhow::Result<Translator> {
    let mut builder = SpecificationBuilder::new("sectioned", Endian::Big, 1);
    builder.default_space("ram", 4, 1)?;
    builder.space("register", SpaceKind::Register, 4, 1)?;
    builder.register("r0", "register", 0, 4)?;
    builder.register("r1", "register", 4, 4)?;

    builder.token("instr", 16, Endian::Big)?;
    builder.field("instr", "op", 12, 15, false, true)?;
    builder.token("ext", 8, Endian::Big)?;
    builder.field("ext", "x", 0, 7, false, true)?;
    builder.subtable("arg")?;

    builder
        .constructor("arg")
        .pattern(PatternEquation::equal("x", 0x7f))
        .print("X")
        .section("alt", vec![Statement::copy(Value::register("r1"), Value::constant(7, 4))])
        .finish()?;

    builder
        .constructor("instruction")
        .pattern(PatternEquation::equal("op", 1))
        .print("NOP")
        .template(Vec::new())
        .section("alt", vec![Statement::copy(Value::register("r0"), Value::constant(1, 4))])
        .finish()?;

    builder
        .constructor("instruction")
        .pattern(PatternEquation::equal("op", 2))
        .print("JMP")
        .template(vec![Statement::op(
            Opcode::Branch,
            None,
            vec![Value::memory("ram", Value::constant(0x40, 4), 4)],
        )])
        .delay_slot(2)
        .finish()?;

    builder
        .constructor("instruction")
        .operand("arg", OperandSpec::symbol("arg"))
        .pattern(PatternEquation::equal("op", 3).cat(PatternEquation::bind("arg")))
        .print("EXT arg")
        .finish()?;

    Ok(Translator::new(Arc::new(builder.build()?))?)
}

#[test]
fn named_sections() -> anyhow::Result<()> {
    let translator = sectioned()?;
    let mut db = translator.context_database();
    let at = translator.address(0x80);

    let main = translator.lift_pcode(&mut db, at.clone(), &[0x10, 0x00])?;
    assert!(main.operations().is_empty());

    let alt = translator.lift_section(&mut db, at.clone(), &[0x10, 0x00], "alt")?;
    assert_eq!(alt.operations().len(), 1);
    assert_eq!(alt.operations()[0].output().map(|v| v.offset()), Some(0));

    let nested = translator.lift_section(&mut db, at.clone(), &[0x30, 0x00, 0x7f], "alt")?;
    assert_eq!(nested.length(), 3);
    assert_eq!(nested.operations().len(), 1);
    assert_eq!(nested.operations()[0].output().map(|v| v.offset()), Some(4));

    let unimplemented = translator.lift_pcode(&mut db, at.clone(), &[0x30, 0x00, 0x7f]);
    assert!(matches!(unimplemented, Err(Error::UnimplementedSemantics { .. })));

    let unknown = translator.lift_section(&mut db, at, &[0x10, 0x00], "missing");
    assert!(matches!(unknown, Err(Error::Specification(_))));
    Ok(())
}

#[test]
fn trailing_delay_slot() -> anyhow::Result<()> {
    let translator = sectioned()?;
    let mut db = translator.context_database();

    let pcode = translator.lift_pcode(&mut db, translator.address(0), &[0x20, 0x00, 0x10, 0x00])?;
    let opcodes = pcode.operations().iter().map(|op| op.opcode()).collect::<Vec<_>>();
    assert_eq!(opcodes, vec![Opcode::Branch]);
    assert_eq!(pcode.delay_slots(), 2);

    let pcode = translator.lift_section(&mut db, translator.address(0), &[0x20, 0x00, 0x10, 0x00], "alt")?;
    assert!(pcode.operations().is_empty());
    Ok(())
}

fn ordered(swap: bool) -> anyhow::Result<Translator> {
    let mut builder = SpecificationBuilder::new("ordered", Endian::Big, 1);
    builder.default_space("ram", 4, 1)?;
    builder.token("instr", 8, Endian::Big)?;
    builder.field("instr", "op", 4, 7, false, true)?;
    builder.field("instr", "low", 0, 3, false, true)?;

    let mut constructors = vec![
        ("INC low", PatternEquation::equal("op", 1) & PatternEquation::bind("low")),
        ("DEC low", PatternEquation::equal("op", 2) & PatternEquation::bind("low")),
    ];
    if swap {
        constructors.reverse();
    }

    for (print, pattern) in constructors {
        builder
            .constructor("instruction")
            .operand("low", OperandSpec::symbol("low"))
            .pattern(pattern)
            .print(print)
            .template(Vec::new())
            .finish()?;
    }

    Ok(Translator::new(Arc::new(builder.build()?))?)
}

#[test]
fn exclusive_constructors_ignore_table_order() -> anyhow::Result<()> {
    let forward = ordered(false)?;
    let reverse = ordered(true)?;

    for bytes in [[0x13u8], [0x2f], [0x30]] {
        let a = text(&forward, &mut forward.context_database(), 0, &bytes);
        let b = text(&reverse, &mut reverse.context_database(), 0, &bytes);
        match (a, b) {
            (Ok(a), Ok(b)) => assert_eq!(a, b),
            (Err(_), Err(_)) => (),
            (a, b) => panic!("orders disagree on {:02x?}: {:?} / {:?}", bytes, a, b),
        }
    }

    assert_eq!(text(&forward, &mut forward.context_database(), 0, &[0x13])?, "INC 0x3");
    Ok(())
}
