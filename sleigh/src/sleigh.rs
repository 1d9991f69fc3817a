use std::path::Path;
use std::sync::Arc;

use sleigh_arch::Mode;
use sleigh_ir::{Address, ContextDatabase, Specification, Translator};

use crate::emit::{AssemblyEmit, PcodeEmit};
use crate::error::{Error, Result};
use crate::loader::LoadImage;
use crate::setting::SleighSetting;

/// A decoding session: one specification, one context database, and the
/// sinks decoded instructions are emitted to.
pub struct Sleigh {
    translator: Translator,
    context: ContextDatabase,
    mode: Mode,
    asm_emit: Box<dyn AssemblyEmit>,
    pcode_emit: Box<dyn PcodeEmit>,
    loader: Box<dyn LoadImage>,
}

impl Sleigh {
    pub fn with_setting(setting: SleighSetting) -> Result<Self> {
        let SleighSetting {
            asm_emit,
            pcode_emit,
            loader,
            spec,
            mode,
            max_delay_depth,
            window,
        } = setting;

        let spec = spec.ok_or_else(|| Error::MissingArg("specification".to_owned()))?;

        let mut translator = Translator::new(spec)?;
        translator.set_max_delay_depth(max_delay_depth);
        translator.set_window(window);

        let mut sleigh = Self {
            context: translator.context_database(),
            translator,
            mode,
            asm_emit,
            pcode_emit,
            loader,
        };
        sleigh.set_mode(mode);

        Ok(sleigh)
    }

    pub fn with_spec(spec: Arc<Specification>, loader: Box<dyn LoadImage>) -> Result<Self> {
        Self::with_setting(SleighSetting::with_spec(spec, loader))
    }

    pub fn with_spec_file(path: impl AsRef<Path>, loader: Box<dyn LoadImage>) -> Result<Self> {
        let spec = Specification::from_file(path)?;
        Self::with_spec(Arc::new(spec), loader)
    }

    pub fn with_arch(arch: &str, loader: Box<dyn LoadImage>) -> Result<Self> {
        Self::with_setting(SleighSetting::with_arch(arch, loader)?)
    }

    fn fetch(&mut self, address: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.translator.window()];
        let available = self.loader.load_fill(&mut buf, address);
        if available == 0 {
            return Err(Error::NotEnoughBytes(address))
        }
        buf.truncate(available);
        Ok(buf)
    }

    /// Disassembles the instruction at `address` to the assembly sink and
    /// returns its length.
    pub fn decode_asm_at(&mut self, address: u64) -> Result<usize> {
        let bytes = self.fetch(address)?;
        let insn = self.translator.disassemble(
            &mut self.context,
            self.translator.address(address),
            &bytes,
        )?;

        self.asm_emit.dump(&insn.address, insn.mnemonic(), insn.body());
        Ok(insn.length())
    }

    /// Lifts the instruction at `address` to the p-code sink and returns
    /// its length.
    pub fn decode_pcode_at(&mut self, address: u64) -> Result<usize> {
        let bytes = self.fetch(address)?;
        let pcode = self.translator.lift_pcode(
            &mut self.context,
            self.translator.address(address),
            &bytes,
        )?;

        self.pcode_emit.begin(pcode.address());
        for op in pcode.operations() {
            self.pcode_emit.dump(pcode.address(), op.opcode(), op.output(), op.inputs());
        }
        Ok(pcode.length())
    }

    /// Emits both renderings of the instruction at `address`.
    pub fn decode_at(&mut self, address: u64) -> Result<usize> {
        let length = self.decode_asm_at(address)?;
        self.decode_pcode_at(address)?;
        Ok(length)
    }

    /// Decodes consecutive instructions from `start` until the image's
    /// bytes are used up or `count` instructions have been decoded;
    /// returns the number decoded. A `count` of zero is unbounded.
    pub fn decode(&mut self, start: u64, count: Option<usize>) -> Result<usize> {
        let size = self.loader.buf_size();
        let limit = count.filter(|count| *count > 0);
        let mut address = start;
        let mut used = 0;
        let mut decoded = 0;

        while used < size && limit.map(|limit| decoded < limit).unwrap_or(true) {
            let length = self.decode_at(address)?;
            address = address.wrapping_add(length as u64);
            used += length;
            decoded += 1;
        }

        log::debug!("decoded {} instructions ({} bytes) from {:#x}", decoded, used, start);
        Ok(decoded)
    }

    pub fn set_asm_emit(&mut self, asm_emit: Box<dyn AssemblyEmit>) {
        self.asm_emit = asm_emit;
    }

    pub fn set_pcode_emit(&mut self, pcode_emit: Box<dyn PcodeEmit>) {
        self.pcode_emit = pcode_emit;
    }

    pub fn set_loader(&mut self, loader: Box<dyn LoadImage>) {
        self.loader = loader;
    }

    /// Switches the processor mode; the `addrsize`/`opsize` defaults it
    /// implies apply to addresses without explicit context.
    pub fn set_mode(&mut self, mode: Mode) {
        for (name, value) in mode.context_defaults() {
            if self.translator.set_variable_default(name, value).is_some() {
                self.context.set_variable_default(name, value);
            } else {
                log::trace!("`{}` has no `{}` context variable", self.translator.specification().name(), name);
            }
        }
        self.mode = mode;
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Sets `name` for every address without explicit context.
    pub fn set_context_variable(&mut self, name: &str, value: u32) -> Result<()> {
        self.context
            .set_variable_default(name, value)
            .ok_or_else(|| Error::UnknownVariable(name.to_owned()))
    }

    /// Sets `name` from `address` up to the next address with explicit
    /// context.
    pub fn set_context_variable_at(&mut self, name: &str, address: u64, value: u32) -> Result<()> {
        self.context
            .set_variable(name, Address::from(address), value)
            .ok_or_else(|| Error::UnknownVariable(name.to_owned()))
    }

    pub fn context_variable(&self, name: &str, address: u64) -> Option<u32> {
        self.context.get_variable(name, Address::from(address))
    }

    pub fn context_database(&self) -> &ContextDatabase {
        &self.context
    }

    pub fn translator(&self) -> &Translator {
        &self.translator
    }

    pub fn asm_emit(&self) -> &dyn AssemblyEmit {
        self.asm_emit.as_ref()
    }

    pub fn asm_emit_mut(&mut self) -> &mut dyn AssemblyEmit {
        self.asm_emit.as_mut()
    }

    pub fn pcode_emit(&self) -> &dyn PcodeEmit {
        self.pcode_emit.as_ref()
    }

    pub fn pcode_emit_mut(&mut self) -> &mut dyn PcodeEmit {
        self.pcode_emit.as_mut()
    }

    pub fn load_image(&self) -> &dyn LoadImage {
        self.loader.as_ref()
    }

    pub fn load_image_mut(&mut self) -> &mut dyn LoadImage {
        self.loader.as_mut()
    }
}
