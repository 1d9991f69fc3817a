use std::borrow::Borrow;
use std::collections::BTreeMap as Map;
use std::mem;

use itertools::Itertools;

use crate::address::Address;
use crate::disassembly::partmap::PartMap;

const WORD_BITS: usize = 8 * mem::size_of::<u32>();

/// A context variable's location: bits `start_bit..=end_bit` of one
/// context word, numbered from the most significant bit.
#[derive(Debug, Clone)]
pub struct ContextBitRange {
    word: usize,
    start_bit: usize,
    end_bit: usize,
    shift: u32,
    mask: u32,
}

impl ContextBitRange {
    pub fn new(start_bit: usize, end_bit: usize) -> Self {
        let word = start_bit / WORD_BITS;
        let start_bit = start_bit - word * WORD_BITS;
        let end_bit = end_bit - word * WORD_BITS;
        let shift = (WORD_BITS - end_bit - 1) as u32;
        let mask = (!0u32).checked_shr(start_bit as u32 + shift).unwrap_or(0);

        Self {
            word,
            start_bit,
            end_bit,
            shift,
            mask,
        }
    }

    pub fn start_bit(&self) -> usize {
        self.start_bit
    }

    pub fn end_bit(&self) -> usize {
        self.end_bit
    }

    pub fn word(&self) -> usize {
        self.word
    }

    pub fn shift(&self) -> u32 {
        self.shift
    }

    pub fn mask(&self) -> u32 {
        self.mask
    }

    /// The variable's mask in word position.
    pub fn word_mask(&self) -> u32 {
        self.mask.checked_shl(self.shift).unwrap_or(0)
    }

    fn get(&self, values: &[u32]) -> u32 {
        values
            .get(self.word)
            .map(|v| v.checked_shr(self.shift).unwrap_or(0) & self.mask)
            .unwrap_or(0)
    }

    fn set(&self, values: &mut [u32], value: u32) {
        if let Some(word) = values.get_mut(self.word) {
            *word &= !self.word_mask();
            *word |= (value & self.mask).checked_shl(self.shift).unwrap_or(0);
        }
    }
}

#[derive(Debug, Clone, Default)]
struct FreeArray {
    values: Vec<u32>,
    masks: Vec<u32>,
}

impl FreeArray {
    fn reset(&mut self, size: usize) {
        self.values.resize_with(size, Default::default);
        self.masks.resize_with(size, Default::default);
    }
}

/// Context values over the address range of a decode session.
///
/// Values form runs: a change point at `a` holds until the next point that
/// explicitly sets the same bits.
#[derive(Debug, Clone)]
pub struct ContextDatabase {
    size: usize,
    variables: Map<String, ContextBitRange>,
    database: PartMap<Address, FreeArray>,
}

impl Default for ContextDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextDatabase {
    pub fn new() -> Self {
        Self {
            size: 0,
            variables: Map::new(),
            database: PartMap::new(Default::default()),
        }
    }

    /// Number of context words.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn variable<S: Borrow<str>>(&self, name: S) -> Option<&ContextBitRange> {
        self.variables.get(name.borrow())
    }

    pub fn variables(&self) -> impl Iterator<Item = (&str, &ContextBitRange)> {
        self.variables.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn get_variable<S: Borrow<str>>(&self, name: S, address: Address) -> Option<u32> {
        self.variable(name.borrow())
            .map(|context| context.get(&self.database.get_or_default(&address).values))
    }

    pub fn set_variable<S: Borrow<str>>(
        &mut self,
        name: S,
        address: Address,
        value: u32,
    ) -> Option<()> {
        let context = self.variables.get(name.borrow())?;
        let num = context.word();
        let mask = context.word_mask();

        get_region_to_change_point(&mut self.database, address, num, mask, |change| {
            context.set(change, value)
        });

        Some(())
    }

    pub fn set_variable_default<S: Borrow<str>>(&mut self, name: S, value: u32) -> Option<()> {
        let context = self.variables.get(name.borrow())?;
        let default = self.database.default_value_mut();

        context.set(&mut default.values, value);

        Some(())
    }

    /// Registers a variable; fails when it straddles two words or values
    /// have already been recorded.
    pub fn register_variable<S: Borrow<str>>(
        &mut self,
        name: S,
        start_bit: usize,
        end_bit: usize,
    ) -> Option<()> {
        if !self.database.is_empty() || end_bit < start_bit {
            return None;
        }

        let size = start_bit / WORD_BITS + 1;
        if end_bit / WORD_BITS + 1 != size {
            return None;
        }

        if size > self.size {
            self.size = size;
            self.database.default_value_mut().reset(size);
        }

        self.variables
            .insert(name.borrow().to_owned(), ContextBitRange::new(start_bit, end_bit));

        Some(())
    }

    pub fn get_context(&self, address: Address) -> &[u32] {
        &self.database.get_or_default(&address).values
    }

    pub fn default_context(&self) -> &[u32] {
        &self.database.default_value().values
    }

    /// Sets the masked bits of word `num` from `address` onward, up to the
    /// next point that sets any of the same bits.
    pub fn set_context_change_point(
        &mut self,
        address: Address,
        num: usize,
        mask: u32,
        value: u32,
    ) {
        if num >= self.size {
            return
        }

        get_region_to_change_point(&mut self.database, address, num, mask, |change| {
            let val = &mut change[num];
            *val &= !mask;
            *val |= value & mask;
        })
    }

    /// Sets the masked bits of word `num` over `[addr1, addr2)`, or from
    /// `addr1` onward when `addr2` is absent.
    pub fn set_context_region(
        &mut self,
        addr1: Address,
        addr2: Option<Address>,
        num: usize,
        mask: u32,
        value: u32,
    ) {
        if num >= self.size {
            return
        }

        get_region_for_set(&mut self.database, addr1, addr2, num, mask, |change| {
            change[num] = (change[num] & !mask) | (value & mask);
        })
    }

    pub fn set_variable_region<S: Borrow<str>>(
        &mut self,
        name: S,
        addr1: Address,
        addr2: Option<Address>,
        value: u32,
    ) -> Option<()> {
        let context = self.variables.get(name.borrow())?;
        get_region_for_set(
            &mut self.database,
            addr1,
            addr2,
            context.word(),
            context.word_mask(),
            |change| context.set(change, value),
        );
        Some(())
    }
}

fn get_region_to_change_point<F>(
    db: &mut PartMap<Address, FreeArray>,
    addr: Address,
    num: usize,
    mask: u32,
    mut f: F,
) where
    F: FnMut(&mut Vec<u32>),
{
    use itertools::Position;

    db.split(&addr);

    for change in db
        .range_mut(addr..)
        .with_position()
        .take_while(move |pos| match pos {
            Position::First(_) | Position::Only(_) => true,
            Position::Middle((_, fa)) | Position::Last((_, fa)) => fa.masks[num] & mask == 0,
        })
        .map(move |pos| match pos {
            Position::First((_, fa)) | Position::Only((_, fa)) => {
                fa.masks[num] |= mask;
                &mut fa.values
            }
            Position::Middle((_, fa)) | Position::Last((_, fa)) => &mut fa.values,
        })
    {
        f(change)
    }
}

fn get_region_for_set<F>(
    db: &mut PartMap<Address, FreeArray>,
    addr1: Address,
    addr2: Option<Address>,
    num: usize,
    mask: u32,
    mut f: F,
) where
    F: FnMut(&mut Vec<u32>),
{
    db.split(&addr1);

    let ranges = if let Some(addr2) = addr2.filter(|a2| *a2 > addr1) {
        db.split(&addr2);
        db.range_mut(addr1..addr2)
    } else {
        db.range_mut(addr1..)
    };

    for (_, fa) in ranges {
        fa.masks[num] |= mask;
        f(&mut fa.values)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn database() -> ContextDatabase {
        let mut db = ContextDatabase::new();
        db.register_variable("addrsize", 0, 1).unwrap();
        db.register_variable("phase", 2, 2).unwrap();
        db.register_variable("high", 32, 39).unwrap();
        db
    }

    #[test]
    fn msb_first_layout() {
        let db = database();
        let addrsize = db.variable("addrsize").unwrap();
        assert_eq!(addrsize.word(), 0);
        assert_eq!(addrsize.shift(), 30);
        assert_eq!(addrsize.mask(), 0b11);
        assert_eq!(db.variable("high").unwrap().word(), 1);
        assert_eq!(db.size(), 2);

        let mut db = db;
        assert!(db.register_variable("straddle", 30, 33).is_none());
    }

    #[test]
    fn defaults_and_change_points() {
        let mut db = database();
        db.set_variable_default("addrsize", 1).unwrap();
        assert_eq!(db.get_variable("addrsize", Address::from(0)), Some(1));
        assert_eq!(db.default_context()[0], 0x4000_0000);

        db.set_variable("addrsize", Address::from(0x10), 2).unwrap();
        assert_eq!(db.get_variable("addrsize", Address::from(0xf)), Some(1));
        assert_eq!(db.get_variable("addrsize", Address::from(0x10)), Some(2));
        assert_eq!(db.get_variable("addrsize", Address::from(0x1000)), Some(2));

        // an earlier point stops at the later explicit setting
        db.set_variable("addrsize", Address::from(0x8), 3).unwrap();
        assert_eq!(db.get_variable("addrsize", Address::from(0x9)), Some(3));
        assert_eq!(db.get_variable("addrsize", Address::from(0x10)), Some(2));

        // unrelated bits flow through
        db.set_variable("phase", Address::from(0x4), 1).unwrap();
        assert_eq!(db.get_variable("phase", Address::from(0x20)), Some(1));
        assert_eq!(db.get_variable("addrsize", Address::from(0x20)), Some(2));
    }

    #[test]
    fn bounded_region() {
        let mut db = database();
        db.set_context_region(Address::from(4), Some(Address::from(5)), 0, 0x2000_0000, 0x2000_0000);
        assert_eq!(db.get_variable("phase", Address::from(3)), Some(0));
        assert_eq!(db.get_variable("phase", Address::from(4)), Some(1));
        assert_eq!(db.get_variable("phase", Address::from(5)), Some(0));

        db.set_variable_region("high", Address::from(8), None, 0xab).unwrap();
        assert_eq!(db.get_variable("high", Address::from(7)), Some(0));
        assert_eq!(db.get_variable("high", Address::from(0x100)), Some(0xab));
        assert_eq!(db.get_context(Address::from(0x100))[1], 0xab00_0000);
    }
}
