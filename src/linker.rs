//! In-memory linking of compiled type tables.
//!
//! The compiler emits each `Type` and `TypeParser` as a symbol: a byte image
//! plus relocations naming other symbols. Cyclic schemas fall out for free,
//! because a symbol can be referenced before its body has been written.
//! `link` lays the symbols out back to back (respecting per-symbol
//! alignment), copies them into one buffer allocated from the caller's
//! arena, and patches every relocation site.

use std::collections::HashMap;

use core::alloc::Layout;

use crate::Error;
use crate::arena::Arena;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RelocKind {
    /// Write the absolute address `buffer + target_offset + addend`.
    Address,
    /// Write the 32-bit buffer offset `target_offset + addend`.
    Abs32,
}

struct Reloc {
    offset: usize,
    kind: RelocKind,
    target: String,
    addend: usize,
}

struct Symbol {
    name: String,
    align: usize,
    data: Vec<u8>,
    relocs: Vec<Reloc>,
}

/// Handle to a symbol under construction.
pub struct Sym(usize);

#[derive(Default)]
pub struct Linker {
    symbols: Vec<Symbol>,
    by_name: HashMap<String, usize>,
}

/// A linked, immutable library image.
pub(crate) struct LinkedImage {
    pub base: *mut u8,
    pub len: usize,
    pub offsets: HashMap<String, usize>,
}

impl Linker {
    pub fn new() -> Self {
        Linker::default()
    }

    /// Allocate a new symbol; the name is its key and must be unique.
    pub fn new_symbol(&mut self, name: &str, align: usize) -> Result<Sym, Error> {
        debug_assert!(align.is_power_of_two());
        if self.by_name.contains_key(name) {
            return Err(Error::DuplicateSymbol(name.to_string()));
        }
        let idx = self.symbols.len();
        self.by_name.insert(name.to_string(), idx);
        self.symbols.push(Symbol {
            name: name.to_string(),
            align,
            data: Vec::new(),
            relocs: Vec::new(),
        });
        Ok(Sym(idx))
    }

    pub fn data_mut(&mut self, sym: &Sym) -> &mut Vec<u8> {
        &mut self.symbols[sym.0].data
    }

    pub fn len(&self, sym: &Sym) -> usize {
        self.symbols[sym.0].data.len()
    }

    /// Record a relocation at `offset` within the symbol's data.
    pub fn reloc(&mut self, sym: &Sym, offset: usize, kind: RelocKind, target: &str, addend: usize) {
        self.symbols[sym.0].relocs.push(Reloc {
            offset,
            kind,
            target: target.to_string(),
            addend,
        });
    }

    /// Lay out, copy, and patch. The buffer is allocated from `arena` so its
    /// address never changes afterwards.
    pub(crate) fn link(self, arena: &mut Arena<'_>) -> Result<LinkedImage, Error> {
        let mut offsets = HashMap::with_capacity(self.symbols.len());
        let mut total: usize = 0;
        let mut max_align = 8usize;
        for sym in &self.symbols {
            total = align_up(total, sym.align);
            offsets.insert(sym.name.clone(), total);
            total += sym.data.len();
            max_align = max_align.max(sym.align);
        }
        if total > i32::MAX as usize {
            return Err(Error::TooManyDependencies);
        }

        let layout =
            Layout::from_size_align(total.max(1), max_align).map_err(|_| Error::AllocError)?;
        let base = arena.alloc_raw(layout)?.as_ptr();

        for sym in &self.symbols {
            let sym_off = offsets[&sym.name];
            unsafe {
                core::ptr::copy_nonoverlapping(sym.data.as_ptr(), base.add(sym_off), sym.data.len());
            }
            for reloc in &sym.relocs {
                let target_off = *offsets
                    .get(&reloc.target)
                    .ok_or_else(|| Error::UndefinedSymbol(reloc.target.clone()))?;
                let resolved = target_off + reloc.addend;
                debug_assert!(resolved <= total);
                let site = unsafe { base.add(sym_off + reloc.offset) };
                match reloc.kind {
                    RelocKind::Address => {
                        let addr = base as usize + resolved;
                        unsafe {
                            core::ptr::write_unaligned(site as *mut usize, addr);
                        }
                    }
                    RelocKind::Abs32 => unsafe {
                        core::ptr::write_unaligned(site as *mut u32, resolved as u32);
                    },
                }
            }
            log::debug!(
                "linked symbol {} at +{:#x} ({} bytes, {} relocs)",
                sym.name,
                sym_off,
                sym.data.len(),
                sym.relocs.len()
            );
        }

        Ok(LinkedImage {
            base,
            len: total,
            offsets,
        })
    }
}

pub(crate) fn align_up(v: usize, align: usize) -> usize {
    (v + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use allocator_api2::alloc::Global;

    #[test]
    fn duplicate_symbol_is_fatal() {
        let mut linker = Linker::new();
        linker.new_symbol("a", 8).unwrap();
        assert!(matches!(
            linker.new_symbol("a", 8),
            Err(Error::DuplicateSymbol(_))
        ));
    }

    #[test]
    fn undefined_target_is_fatal() {
        let mut linker = Linker::new();
        let a = linker.new_symbol("a", 8).unwrap();
        linker.data_mut(&a).extend_from_slice(&[0u8; 8]);
        linker.reloc(&a, 0, RelocKind::Address, "missing", 0);
        let mut arena = Arena::new(&Global);
        assert!(matches!(
            linker.link(&mut arena),
            Err(Error::UndefinedSymbol(_))
        ));
    }

    #[test]
    fn address_and_abs32_patching() {
        let mut linker = Linker::new();
        let a = linker.new_symbol("a", 8).unwrap();
        linker.data_mut(&a).extend_from_slice(&[0u8; 16]);
        // Site 0: absolute address of b. Site 8: 32-bit offset of b + 4.
        linker.reloc(&a, 0, RelocKind::Address, "b", 0);
        linker.reloc(&a, 8, RelocKind::Abs32, "b", 4);
        let b = linker.new_symbol("b", 8).unwrap();
        linker.data_mut(&b).extend_from_slice(&[0xEE; 8]);

        let mut arena = Arena::new(&Global);
        let image = linker.link(&mut arena).unwrap();
        assert_eq!(image.offsets["a"], 0);
        assert_eq!(image.offsets["b"], 16);
        unsafe {
            let addr = core::ptr::read_unaligned(image.base as *const usize);
            assert_eq!(addr, image.base as usize + 16);
            let off = core::ptr::read_unaligned(image.base.add(8) as *const u32);
            assert_eq!(off, 20);
            // Relocation resolved inside the buffer.
            assert!(addr < image.base as usize + image.len);
        }
    }

    #[test]
    fn cyclic_references_resolve() {
        let mut linker = Linker::new();
        let a = linker.new_symbol("a", 8).unwrap();
        linker.data_mut(&a).extend_from_slice(&[0u8; 8]);
        linker.reloc(&a, 0, RelocKind::Address, "b", 0);
        let b = linker.new_symbol("b", 8).unwrap();
        linker.data_mut(&b).extend_from_slice(&[0u8; 8]);
        linker.reloc(&b, 0, RelocKind::Address, "a", 0);

        let mut arena = Arena::new(&Global);
        let image = linker.link(&mut arena).unwrap();
        unsafe {
            let a_to_b = core::ptr::read_unaligned(image.base as *const usize);
            let b_to_a = core::ptr::read_unaligned(image.base.add(8) as *const usize);
            assert_eq!(a_to_b, image.base as usize + 8);
            assert_eq!(b_to_a, image.base as usize);
        }
    }

    #[test]
    fn alignment_padding_recorded_after_symbol() {
        let mut linker = Linker::new();
        let a = linker.new_symbol("a", 4).unwrap();
        linker.data_mut(&a).extend_from_slice(&[1, 2, 3]);
        let b = linker.new_symbol("b", 8).unwrap();
        linker.data_mut(&b).extend_from_slice(&[4u8; 8]);
        let mut arena = Arena::new(&Global);
        let image = linker.link(&mut arena).unwrap();
        assert_eq!(image.offsets["b"], 8);
    }
}
