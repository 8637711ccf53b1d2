//! Image layout - maps static addresses to file offsets.
//!
//! Parses PE/ELF/Mach-O headers with goblin and keeps only the pieces the
//! patch database needs: file-backed ranges and the entry point.

use std::fs;
use std::path::Path;

use anyhow::{anyhow, Result};

use crate::debug::INVALID_FILE_OFFSET;

/// A file-backed range of the image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionInfo {
    /// Section or segment name
    pub name: String,
    /// Virtual address
    pub virtual_address: u64,
    /// Size in memory
    pub virtual_size: u64,
    /// Offset in file
    pub file_offset: u64,
    /// Size in file (0 for zero-fill ranges like .bss)
    pub file_size: u64,
}

impl SectionInfo {
    /// File offset of `address`, if it lies in the file-backed part
    fn file_offset_of(&self, address: u64) -> Option<u64> {
        let delta = address.checked_sub(self.virtual_address)?;
        (delta < self.file_size).then(|| self.file_offset + delta)
    }
}

#[derive(Debug, Clone)]
pub struct ImageLayout {
    pub path: String,
    /// Binary format (PE, ELF, Mach-O)
    pub format: String,
    pub entry_point: u64,
    pub image_base: u64,
    /// Position independent: load address differs from static addresses
    pub is_pie: bool,
    pub sections: Vec<SectionInfo>,
}

impl ImageLayout {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let data = fs::read(&path)?;
        Self::from_bytes(&data, path_str)
    }

    pub fn from_bytes(data: &[u8], path: String) -> Result<Self> {
        if data.len() < 4 {
            return Err(anyhow!("File too small"));
        }

        match goblin::Object::parse(data)? {
            goblin::Object::PE(pe) => Ok(Self::from_pe(&pe, path)),
            goblin::Object::Elf(elf) => Ok(Self::from_elf(&elf, path)),
            goblin::Object::Mach(goblin::mach::Mach::Binary(macho)) => {
                Ok(Self::from_macho(&macho, path))
            }
            goblin::Object::Mach(goblin::mach::Mach::Fat(_)) => {
                Err(anyhow!("Fat Mach-O binaries not yet supported"))
            }
            _ => Err(anyhow!("Unknown binary format")),
        }
    }

    fn from_pe(pe: &goblin::pe::PE, path: String) -> Self {
        let image_base = pe.image_base as u64;
        let sections = pe
            .sections
            .iter()
            .map(|section| SectionInfo {
                name: String::from_utf8_lossy(&section.name)
                    .trim_end_matches('\0')
                    .to_string(),
                virtual_address: image_base + section.virtual_address as u64,
                virtual_size: section.virtual_size as u64,
                file_offset: section.pointer_to_raw_data as u64,
                // Raw data is padded to file alignment; only the mapped part counts
                file_size: match section.virtual_size {
                    0 => section.size_of_raw_data as u64,
                    vsize => (section.size_of_raw_data as u64).min(vsize as u64),
                },
            })
            .collect();

        Self {
            path,
            format: "PE".to_string(),
            entry_point: image_base + pe.entry as u64,
            image_base,
            is_pie: false,
            sections,
        }
    }

    fn from_elf(elf: &goblin::elf::Elf, path: String) -> Self {
        use goblin::elf::header::ET_DYN;
        use goblin::elf::program_header::PT_LOAD;

        let sections: Vec<SectionInfo> = elf
            .program_headers
            .iter()
            .filter(|ph| ph.p_type == PT_LOAD)
            .enumerate()
            .map(|(i, ph)| SectionInfo {
                name: format!("LOAD{}", i),
                virtual_address: ph.p_vaddr,
                virtual_size: ph.p_memsz,
                file_offset: ph.p_offset,
                file_size: ph.p_filesz,
            })
            .collect();

        let image_base = sections
            .iter()
            .map(|s| s.virtual_address)
            .min()
            .unwrap_or(0);

        Self {
            path,
            format: "ELF".to_string(),
            entry_point: elf.entry,
            image_base,
            is_pie: elf.header.e_type == ET_DYN,
            sections,
        }
    }

    fn from_macho(macho: &goblin::mach::MachO, path: String) -> Self {
        let sections = (&macho.segments)
            .into_iter()
            .map(|segment| SectionInfo {
                name: segment.name().unwrap_or("").to_string(),
                virtual_address: segment.vmaddr,
                virtual_size: segment.vmsize,
                file_offset: segment.fileoff,
                file_size: segment.filesize,
            })
            .collect();

        Self {
            path,
            format: "Mach-O".to_string(),
            entry_point: macho.entry,
            image_base: 0,
            is_pie: false,
            sections,
        }
    }

    /// File offset backing `address`, or the invalid sentinel
    pub fn file_offset(&self, address: u64) -> i64 {
        self.sections
            .iter()
            .find_map(|s| s.file_offset_of(address))
            .and_then(|off| i64::try_from(off).ok())
            .unwrap_or(INVALID_FILE_OFFSET)
    }

    pub fn summary(&self) -> String {
        format!(
            "{} binary{}\n\
             Entry: 0x{:x}\n\
             Image Base: 0x{:x}\n\
             File-backed ranges: {}",
            self.format,
            if self.is_pie { " (PIE)" } else { "" },
            self.entry_point,
            self.image_base,
            self.sections.len()
        )
    }
}
