use std::any::Any;
use std::collections::BTreeSet;
use std::ops::Range;

use sleigh_ir::{AddressValue, Opcode, VarnodeData};

/// Receives one assembly line per decoded instruction.
pub trait AssemblyEmit {
    fn dump(&mut self, address: &AddressValue, mnemonic: &str, body: &str);

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Receives each p-code operation of a lifted instruction, in order.
pub trait PcodeEmit {
    /// Called once per lifted instruction, before its operations.
    fn begin(&mut self, _address: &AddressValue) {}

    fn dump(
        &mut self,
        address: &AddressValue,
        opcode: Opcode,
        output: Option<&VarnodeData>,
        inputs: &[VarnodeData],
    );

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsmInstruction {
    pub address: AddressValue,
    pub mnemonic: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcodeInstruction {
    pub address: AddressValue,
    /// Position among the operations lifted from one instruction.
    pub seq: u64,
    pub opcode: Opcode,
    pub output: Option<VarnodeData>,
    pub inputs: Vec<VarnodeData>,
}

#[derive(Debug, Default)]
pub struct CollectingAssemblyEmit {
    pub asms: Vec<AsmInstruction>,
}

impl AssemblyEmit for CollectingAssemblyEmit {
    fn dump(&mut self, address: &AddressValue, mnemonic: &str, body: &str) {
        self.asms.push(AsmInstruction {
            address: address.clone(),
            mnemonic: mnemonic.to_owned(),
            body: body.to_owned(),
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[derive(Debug, Default)]
pub struct CollectingPcodeEmit {
    pub pcode_asms: Vec<PcodeInstruction>,
    /// Address and index of the first operation of each instruction.
    instructions: Vec<(AddressValue, usize)>,
}

impl CollectingPcodeEmit {
    /// Operation indices of the `occurrence`-th instruction lifted at
    /// `address`.
    fn operations_of(&self, address: &AddressValue, occurrence: usize) -> Option<Range<usize>> {
        let (position, (_, start)) = self
            .instructions
            .iter()
            .enumerate()
            .filter(|(_, (at, _))| at == address)
            .nth(occurrence)?;
        let end = self
            .instructions
            .get(position + 1)
            .map(|(_, first)| *first)
            .unwrap_or(self.pcode_asms.len());
        Some(*start..end)
    }
}

impl PcodeEmit for CollectingPcodeEmit {
    fn begin(&mut self, address: &AddressValue) {
        self.instructions.push((address.clone(), self.pcode_asms.len()));
    }

    fn dump(
        &mut self,
        address: &AddressValue,
        opcode: Opcode,
        output: Option<&VarnodeData>,
        inputs: &[VarnodeData],
    ) {
        // without `begin`, a change of address starts the next instruction
        let seq = match self.instructions.last() {
            Some((at, first)) if at == address => self.pcode_asms.len() - first,
            _ => {
                self.begin(address);
                0
            }
        };

        self.pcode_asms.push(PcodeInstruction {
            address: address.clone(),
            seq: seq as u64,
            opcode,
            output: output.cloned(),
            inputs: inputs.to_vec(),
        });
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct PcodeAddrIndex {
    offset: u64,
    seq: u64,
    index: usize,
}

impl CollectingAssemblyEmit {
    /// Pairs every collected assembly line with the p-code operations of
    /// the same instruction; the n-th line at an address goes with the n-th
    /// instruction lifted there.
    pub fn correspond<'a>(&'a self, pcodes: &'a CollectingPcodeEmit) -> CorrespondedCollectedAsm<'a> {
        let indices = self
            .asms
            .iter()
            .enumerate()
            .map(|(position, asm)| {
                let occurrence = self.asms[..position]
                    .iter()
                    .filter(|earlier| earlier.address == asm.address)
                    .count();

                pcodes
                    .operations_of(&asm.address, occurrence)
                    .unwrap_or_default()
                    .map(|index| PcodeAddrIndex {
                        offset: asm.address.offset(),
                        seq: pcodes.pcode_asms[index].seq,
                        index,
                    })
                    .collect()
            })
            .collect();

        CorrespondedCollectedAsm {
            asm_emit: self,
            pcode_emit: pcodes,
            indices,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CorrespondedCollectedAsm<'a> {
    asm_emit: &'a CollectingAssemblyEmit,
    pcode_emit: &'a CollectingPcodeEmit,
    indices: Vec<BTreeSet<PcodeAddrIndex>>,
}

impl<'a> CorrespondedCollectedAsm<'a> {
    pub fn asms(&self) -> &[AsmInstruction] {
        &self.asm_emit.asms
    }

    pub fn pcodes(&self) -> &[PcodeInstruction] {
        &self.pcode_emit.pcode_asms
    }

    /// Indices into [`pcodes`](Self::pcodes) of the operations lifted from
    /// assembly line `asm`, ordered by address then sequence number.
    pub fn pcode_indices_of_asm(&self, asm: usize) -> Vec<usize> {
        self.indices
            .get(asm)
            .map(|set| set.iter().map(|i| i.index).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use sleigh_ir::space::{AddressSpace, Space, SpaceKind};

    use super::*;

    fn ram() -> Arc<AddressSpace> {
        Arc::new(AddressSpace::Space(Space::new(SpaceKind::Default, "ram", 4, 1, 1, None, 0)))
    }

    #[test]
    fn sequence_numbers_restart_per_address() {
        let space = ram();
        let a = AddressValue::new(space.clone(), 0x10);
        let b = AddressValue::new(space.clone(), 0x12);
        let v = VarnodeData::new(space, 0x20, 4);

        let mut pcodes = CollectingPcodeEmit::default();
        pcodes.dump(&a, Opcode::Copy, Some(&v), &[v.clone()]);
        pcodes.dump(&a, Opcode::IntAdd, Some(&v), &[v.clone(), v.clone()]);
        pcodes.dump(&b, Opcode::Branch, None, &[v.clone()]);

        let seqs = pcodes.pcode_asms.iter().map(|p| p.seq).collect::<Vec<_>>();
        assert_eq!(seqs, vec![0, 1, 0]);
    }

    #[test]
    fn sequence_numbers_restart_per_instruction() {
        let space = ram();
        let a = AddressValue::new(space.clone(), 0x10);
        let v = VarnodeData::new(space, 0x20, 4);

        let mut asms = CollectingAssemblyEmit::default();
        let mut pcodes = CollectingPcodeEmit::default();
        for _ in 0..2 {
            asms.dump(&a, "ADD", "r0");
            pcodes.begin(&a);
            pcodes.dump(&a, Opcode::Copy, Some(&v), &[v.clone()]);
            pcodes.dump(&a, Opcode::IntAdd, Some(&v), &[v.clone(), v.clone()]);
        }

        let seqs = pcodes.pcode_asms.iter().map(|p| p.seq).collect::<Vec<_>>();
        assert_eq!(seqs, vec![0, 1, 0, 1]);

        let corresponded = asms.correspond(&pcodes);
        assert_eq!(corresponded.pcode_indices_of_asm(0), vec![0, 1]);
        assert_eq!(corresponded.pcode_indices_of_asm(1), vec![2, 3]);
    }

    #[test]
    fn correspondence() {
        let space = ram();
        let a = AddressValue::new(space.clone(), 0x10);
        let b = AddressValue::new(space.clone(), 0x12);
        let c = AddressValue::new(space.clone(), 0x14);
        let v = VarnodeData::new(space, 0x20, 4);

        let mut asms = CollectingAssemblyEmit::default();
        asms.dump(&a, "MOV", "r0");
        asms.dump(&b, "BRD", "");
        asms.dump(&c, "HALT", "");

        let mut pcodes = CollectingPcodeEmit::default();
        pcodes.dump(&a, Opcode::Copy, Some(&v), &[v.clone()]);
        pcodes.dump(&b, Opcode::Copy, Some(&v), &[v.clone()]);
        pcodes.dump(&b, Opcode::Branch, None, &[v.clone()]);

        let corresponded = asms.correspond(&pcodes);
        assert_eq!(corresponded.asms().len(), 3);
        assert_eq!(corresponded.pcodes().len(), 3);
        assert_eq!(corresponded.pcode_indices_of_asm(0), vec![0]);
        assert_eq!(corresponded.pcode_indices_of_asm(1), vec![1, 2]);
        assert!(corresponded.pcode_indices_of_asm(2).is_empty());
        assert!(corresponded.pcode_indices_of_asm(7).is_empty());
    }
}
