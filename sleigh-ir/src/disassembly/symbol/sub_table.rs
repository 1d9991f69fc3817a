use crate::disassembly::construct::ConstructTpl;
use crate::disassembly::pattern::{DisjointPattern, PatternExpression};
use crate::disassembly::symbol::{Symbol, SymbolTable};
use crate::disassembly::{Error, ParserWalker};
use crate::space_manager::SpaceManager;

use smallvec::SmallVec;

/// A context write performed when a constructor is selected.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub enum ContextChange {
    /// Sets the masked bits of context word `num` for the remainder of this
    /// instruction.
    Operator {
        num: usize,
        shift: u32,
        mask: u32,
        pattern_value: PatternExpression,
    },
    /// Records the current masked bits of word `num` to be written into the
    /// context database at the address `symbol_id` resolves to.
    Commit {
        symbol_id: usize,
        num: usize,
        mask: u32,
        flow: bool,
    },
}

impl ContextChange {
    pub fn apply<'b, 'c>(
        &'b self,
        walker: &mut ParserWalker<'b, 'c>,
        symbols: &'b SymbolTable,
    ) -> Result<(), Error> {
        match self {
            Self::Operator {
                num,
                shift,
                mask,
                pattern_value,
            } => {
                let value = pattern_value.value(walker, symbols)? as u32;
                let v = value.checked_shl(*shift).unwrap_or(0);
                walker.set_context_word(*num, v, *mask);
            }
            Self::Commit {
                symbol_id,
                num,
                mask,
                flow,
            } => {
                let sym = symbols.symbol(*symbol_id)?;
                walker.add_commit(sym, *num, *mask, *flow)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub enum PrintPiece {
    Text(String),
    Operand(usize),
}

impl PrintPiece {
    pub fn is_whitespace(&self) -> bool {
        matches!(self, Self::Text(text) if !text.is_empty() && text.trim().is_empty())
    }
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct Constructor {
    id: usize,
    table: usize,
    first_whitespace: Option<usize>,
    min_length: usize,
    operands: SmallVec<[usize; 4]>,
    print_pieces: Vec<PrintPiece>,
    context: Vec<ContextChange>,
    template: Option<ConstructTpl>,
    named_templates: Vec<Option<ConstructTpl>>,
    flow_through_index: Option<usize>,
}

impl PartialEq for Constructor {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.table == other.table
    }
}
impl Eq for Constructor {}

impl Constructor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        table: usize,
        id: usize,
        min_length: usize,
        operands: SmallVec<[usize; 4]>,
        print_pieces: Vec<PrintPiece>,
        context: Vec<ContextChange>,
        template: Option<ConstructTpl>,
        named_templates: Vec<Option<ConstructTpl>>,
    ) -> Self {
        let first_whitespace = print_pieces.iter().position(PrintPiece::is_whitespace);
        let flow_through_index = match print_pieces.as_slice() {
            [PrintPiece::Operand(index)] => Some(*index),
            _ => None,
        };

        Self {
            id,
            table,
            first_whitespace,
            min_length,
            operands,
            print_pieces,
            context,
            template,
            named_templates,
            flow_through_index,
        }
    }

    /// Position within the owning subtable.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Symbol id of the owning subtable.
    pub fn table(&self) -> usize {
        self.table
    }

    pub fn minimum_length(&self) -> usize {
        self.min_length
    }

    pub fn operand(&self, index: usize) -> Result<usize, Error> {
        self.operands.get(index).copied().ok_or(Error::InvalidConstructor)
    }

    pub fn operands(&self) -> &[usize] {
        &self.operands
    }

    pub fn operand_count(&self) -> usize {
        self.operands.len()
    }

    pub fn print_pieces(&self) -> &[PrintPiece] {
        &self.print_pieces
    }

    pub fn context_changes(&self) -> &[ContextChange] {
        &self.context
    }

    pub fn template(&self) -> Option<&ConstructTpl> {
        self.template.as_ref()
    }

    pub fn named_template(&self, index: usize) -> Option<&ConstructTpl> {
        self.named_templates.get(index).and_then(|v| v.as_ref())
    }

    /// Checks the operand, print, context and template references of a
    /// constructor loaded from outside the builder.
    pub(crate) fn check(
        &self,
        symbols: &SymbolTable,
        manager: &SpaceManager,
        sections: usize,
        words: usize,
        span: u64,
    ) -> Result<(), String> {
        let count = self.operands.len();
        for (index, id) in self.operands.iter().enumerate() {
            match symbols.symbol(*id) {
                Ok(Symbol::Operand { handle_index, base, .. }) => {
                    if *handle_index != index {
                        return Err(format!("operand {} claims position {}", index, handle_index))
                    }
                    if base.map_or(false, |base| base >= count || base == index) {
                        return Err(format!("operand {} is placed after an invalid operand", index))
                    }
                }
                Ok(other) => return Err(format!("operand {} is `{}`, not an operand", index, other.name())),
                Err(e) => return Err(format!("operand {}: {}", index, e)),
            }
        }

        for piece in &self.print_pieces {
            if let PrintPiece::Operand(index) = piece {
                if *index >= count {
                    return Err(format!("prints operand {} of {}", index, count))
                }
            }
        }
        if self.first_whitespace.map_or(false, |index| index >= self.print_pieces.len())
            || self.flow_through_index.map_or(false, |index| index >= count)
        {
            return Err("display layout does not match its pieces".to_owned())
        }

        for change in &self.context {
            let num = match change {
                ContextChange::Operator { num, pattern_value, .. } => {
                    pattern_value.check(symbols)?;
                    *num
                }
                ContextChange::Commit { symbol_id, num, .. } => {
                    symbols.symbol(*symbol_id).map_err(|e| e.to_string())?;
                    *num
                }
            };
            if num >= words {
                return Err(format!("writes context word {} of {}", num, words))
            }
        }

        if self.named_templates.len() > sections {
            return Err(format!(
                "has {} named sections but only {} are declared",
                self.named_templates.len(),
                sections
            ))
        }
        for template in self.template.iter().chain(self.named_templates.iter().flatten()) {
            template.check(count, manager, span)?;
        }
        Ok(())
    }

    pub fn apply_context<'b, 'c>(
        &'b self,
        walker: &mut ParserWalker<'b, 'c>,
        symbols: &'b SymbolTable,
    ) -> Result<(), Error> {
        for context in &self.context {
            context.apply(walker, symbols)?;
        }
        Ok(())
    }

    fn format_piece<'b, 'c>(
        &'b self,
        piece: &'b PrintPiece,
        out: &mut String,
        walker: &mut ParserWalker<'b, 'c>,
        symbols: &'b SymbolTable,
    ) -> Result<(), Error> {
        match piece {
            PrintPiece::Text(text) => out.push_str(text),
            PrintPiece::Operand(index) => {
                symbols
                    .symbol(self.operand(*index)?)?
                    .format(out, walker, symbols)?
            }
        }
        Ok(())
    }

    /// Operand index to defer to when this constructor prints nothing but
    /// a single subtable operand.
    fn flow_through<'b>(&'b self, symbols: &'b SymbolTable) -> Result<Option<usize>, Error> {
        if let Some(index) = self.flow_through_index {
            let operand = symbols.symbol(self.operand(index)?)?;
            if let Some(Symbol::Subtable { .. }) = operand.defining_symbol(symbols)? {
                return Ok(Some(index))
            }
        }
        Ok(None)
    }

    pub fn format<'b, 'c>(
        &'b self,
        out: &mut String,
        walker: &mut ParserWalker<'b, 'c>,
        symbols: &'b SymbolTable,
    ) -> Result<(), Error> {
        for piece in &self.print_pieces {
            self.format_piece(piece, out, walker, symbols)?;
        }
        Ok(())
    }

    pub fn format_mnemonic<'b, 'c>(
        &'b self,
        out: &mut String,
        walker: &mut ParserWalker<'b, 'c>,
        symbols: &'b SymbolTable,
    ) -> Result<(), Error> {
        if let Some(index) = self.flow_through(symbols)? {
            walker.push_operand(index)?;
            walker.constructor()?.format_mnemonic(out, walker, symbols)?;
            return walker.pop_operand()
        }

        let end = self.first_whitespace.unwrap_or(self.print_pieces.len());
        for piece in &self.print_pieces[..end] {
            self.format_piece(piece, out, walker, symbols)?;
        }
        Ok(())
    }

    pub fn format_body<'b, 'c>(
        &'b self,
        out: &mut String,
        walker: &mut ParserWalker<'b, 'c>,
        symbols: &'b SymbolTable,
    ) -> Result<(), Error> {
        if let Some(index) = self.flow_through(symbols)? {
            walker.push_operand(index)?;
            walker.constructor()?.format_body(out, walker, symbols)?;
            return walker.pop_operand()
        }

        if let Some(first_whitespace) = self.first_whitespace {
            for piece in &self.print_pieces[first_whitespace + 1..] {
                self.format_piece(piece, out, walker, symbols)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct DecisionPair {
    id: usize,
    pattern: DisjointPattern,
}

impl DecisionPair {
    pub fn new(id: usize, pattern: DisjointPattern) -> Self {
        Self { id, pattern }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn pattern(&self) -> &DisjointPattern {
        &self.pattern
    }

    #[inline(always)]
    pub fn is_match<'b, 'c>(&'b self, walker: &ParserWalker<'b, 'c>) -> bool {
        self.pattern.is_match(walker)
    }
}

/// A subtable's dispatch tree. Interior nodes switch on `size` bits at
/// `start_bit` of the instruction (or context); leaves list the patterns
/// still possible, in table order.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct DecisionNode {
    context_decision: bool,
    start_bit: usize,
    size: usize,
    patterns: Vec<DecisionPair>,
    children: Vec<DecisionNode>,
}

impl Default for DecisionNode {
    fn default() -> Self {
        Self::leaf(Vec::new())
    }
}

impl DecisionNode {
    pub fn leaf(patterns: Vec<DecisionPair>) -> Self {
        Self {
            context_decision: false,
            start_bit: 0,
            size: 0,
            patterns,
            children: Vec::new(),
        }
    }

    /// An interior node with `1 << size` children.
    pub fn branch(context_decision: bool, start_bit: usize, size: usize, children: Vec<DecisionNode>) -> Self {
        Self {
            context_decision,
            start_bit,
            size,
            patterns: Vec::new(),
            children,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.size == 0
    }

    pub fn patterns(&self) -> &[DecisionPair] {
        &self.patterns
    }

    pub fn children(&self) -> &[DecisionNode] {
        &self.children
    }

    /// Checks that interior nodes have a child per value of the bits they
    /// switch on and that leaves name constructors of a `constructors`-long
    /// table.
    pub(crate) fn check(&self, constructors: usize) -> Result<(), String> {
        if self.is_leaf() {
            return match self.patterns.iter().find(|pair| pair.id >= constructors) {
                Some(pair) => Err(format!("decision leaf names constructor {} of {}", pair.id, constructors)),
                None => Ok(()),
            }
        }

        if self.size > 8 * std::mem::size_of::<u32>() || self.children.len() != 1 << self.size {
            return Err(format!(
                "decision node switching on {} bits has {} children",
                self.size,
                self.children.len()
            ))
        }
        self.children.iter().try_for_each(|child| child.check(constructors))
    }

    /// Constructors whose patterns match at the walker's position, in table
    /// order, each listed once.
    pub fn candidates<'b, 'c>(&'b self, walker: &ParserWalker<'b, 'c>) -> Result<SmallVec<[usize; 8]>, Error> {
        let mut node = self;

        while !node.is_leaf() {
            let value = if node.context_decision {
                walker.context_bits(node.start_bit, node.size)
            } else {
                walker.instruction_bits(node.start_bit, node.size)?
            };

            node = node
                .children
                .get(value as usize)
                .ok_or(Error::InconsistentState)?;
        }

        let mut ids = SmallVec::new();
        for pair in node.patterns.iter().filter(|pair| pair.is_match(walker)) {
            if !ids.contains(&pair.id) {
                ids.push(pair.id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn derived_print_layout() {
        let ctor = Constructor::new(
            1,
            0,
            2,
            SmallVec::from_slice(&[5, 6]),
            vec![
                PrintPiece::Text("MOV".into()),
                PrintPiece::Text(" ".into()),
                PrintPiece::Operand(0),
                PrintPiece::Text(",".into()),
                PrintPiece::Operand(1),
            ],
            Vec::new(),
            None,
            Vec::new(),
        );

        assert_eq!(ctor.first_whitespace, Some(1));
        assert_eq!(ctor.flow_through_index, None);
        assert_eq!(ctor.operand(1).unwrap(), 6);
        assert!(ctor.operand(2).is_err());

        let wrapper = Constructor::new(0, 0, 0, SmallVec::from_slice(&[9]), vec![PrintPiece::Operand(0)], Vec::new(), None, Vec::new());
        assert_eq!(wrapper.flow_through_index, Some(0));
        assert_eq!(wrapper.first_whitespace, None);
        assert!(wrapper != ctor);
    }
}
