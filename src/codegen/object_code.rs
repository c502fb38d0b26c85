//! Relocatable object code written by the target machine.
//!
//! Parsed with the `object` crate to list the defined function symbols, and
//! disassembled with `iced-x86` on x86-64 hosts. Relocations are not applied,
//! so call and data displacements show as written in the object.

use crate::core::JitError;
use iced_x86::{Decoder, DecoderOptions, Formatter, Instruction, NasmFormatter};
use object::{
    Architecture, BinaryFormat, File, Object, ObjectSection, ObjectSymbol as _, SymbolKind,
};
use std::fmt::Write as _;

/// A defined, globally visible function in an object file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSymbol {
    pub name: String,
    pub address: u64,
    pub size: u64,
}

/// Bytes of one relocatable object.
#[derive(Debug, Clone)]
pub struct ObjectCode {
    bytes: Vec<u8>,
}

impl ObjectCode {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn parse(&self) -> Result<File<'_>, JitError> {
        File::parse(&*self.bytes).map_err(|e| JitError::ObjectEmission {
            reason: format!("unreadable object: {}", e),
        })
    }

    /// Exported functions, sorted by address.
    pub fn symbols(&self) -> Result<Vec<ObjectSymbol>, JitError> {
        let file = self.parse()?;
        let macho = file.format() == BinaryFormat::MachO;

        let mut symbols = file
            .symbols()
            .filter(|s| s.kind() == SymbolKind::Text && s.is_definition() && s.is_global())
            .filter_map(|s| {
                let name = s.name().ok()?;
                // Mach-O prefixes C symbols with an underscore.
                let name = match macho {
                    true => name.strip_prefix('_').unwrap_or(name),
                    false => name,
                };
                Some(ObjectSymbol {
                    name: name.to_string(),
                    address: s.address(),
                    size: s.size(),
                })
            })
            .collect::<Vec<_>>();
        symbols.sort_by_key(|s| s.address);
        Ok(symbols)
    }

    /// NASM syntax listing of function `name`, one instruction per line.
    pub fn disassemble(&self, name: &str) -> Result<String, JitError> {
        let file = self.parse()?;
        if file.architecture() != Architecture::X86_64 {
            return Err(JitError::Disassembly {
                reason: format!("unsupported architecture {:?}", file.architecture()),
            });
        }

        let symbols = self.symbols()?;
        let symbol = symbols
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| JitError::Disassembly {
                reason: format!("no function `{}` in object", name),
            })?;

        let section = file
            .symbols()
            .find(|s| s.address() == symbol.address && s.is_global())
            .and_then(|s| s.section_index())
            .and_then(|index| file.section_by_index(index).ok())
            .ok_or_else(|| JitError::Disassembly {
                reason: format!("`{}` has no section", name),
            })?;
        let data = section.data().map_err(|e| JitError::Disassembly {
            reason: e.to_string(),
        })?;

        let start = (symbol.address - section.address()) as usize;
        // Mach-O symbols carry no size: run to the next symbol or the section end.
        let end = match symbol.size {
            0 => symbols
                .iter()
                .map(|s| s.address)
                .filter(|&a| a > symbol.address)
                .min()
                .map_or(data.len(), |a| (a - section.address()) as usize),
            size => start + size as usize,
        };
        let code = data.get(start..end.min(data.len())).ok_or_else(|| JitError::Disassembly {
            reason: format!("`{}` lies outside its section", name),
        })?;

        let mut decoder = Decoder::with_ip(64, code, symbol.address, DecoderOptions::NONE);
        let mut formatter = NasmFormatter::new();
        let mut instruction = Instruction::default();
        let mut text = String::new();
        let mut out = String::new();
        while decoder.can_decode() {
            decoder.decode_out(&mut instruction);
            text.clear();
            formatter.format(&instruction, &mut text);
            let _ = writeln!(out, "{:08x}  {}", instruction.ip(), text);
        }
        Ok(out)
    }
}
