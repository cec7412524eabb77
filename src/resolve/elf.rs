//! ELF dynamic information: interpreter, needed libraries and embedded
//! search paths, read with `xmas_elf`. Objects of either class are accepted
//! as long as their byte order matches this host.

use crate::config::types::{Result, XprocError};
use std::fs;
use std::path::Path;
use xmas_elf::dynamic::Tag;
use xmas_elf::program::Type;
use xmas_elf::sections::{SectionData, SectionHeader, ShType};
use xmas_elf::ElfFile;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DynamicInfo {
    /// Program interpreter from PT_INTERP
    pub interpreter: Option<String>,
    /// DT_NEEDED names, in table order
    pub needed: Vec<String>,
    /// DT_RUNPATH then DT_RPATH directories, unexpanded
    pub search_paths: Vec<String>,
}

fn bad(msg: impl Into<String>) -> XprocError {
    XprocError::Resolution(msg.into())
}

const HOST_DATA: u8 = if cfg!(target_endian = "big") { 2 } else { 1 };

fn region(data: &[u8], offset: u64, len: u64) -> Result<&[u8]> {
    usize::try_from(offset)
        .ok()
        .zip(usize::try_from(len).ok())
        .and_then(|(start, len)| data.get(start..start.checked_add(len)?))
        .ok_or_else(|| {
            bad(format!(
                "region {}+{} outside file of {} bytes",
                offset,
                len,
                data.len()
            ))
        })
}

fn c_str_at(table: &[u8], offset: u64) -> Option<String> {
    let start = usize::try_from(offset).ok()?;
    let rest = table.get(start..)?;
    let end = rest.iter().position(|b| *b == 0).unwrap_or(rest.len());
    Some(String::from_utf8_lossy(&rest[..end]).into_owned())
}

/// Reject objects whose byte order or header tables `xmas_elf` cannot
/// read safely.
fn open(data: &[u8]) -> Result<ElfFile<'_>> {
    if data.len() < 16 || &data[..4] != b"\x7fELF" {
        return Err(bad("not an ELF object"));
    }
    if data[5] != HOST_DATA {
        return Err(bad("byte order differs from this host"));
    }
    let elf = ElfFile::new(data).map_err(bad)?;
    let wide = data[4] == 2;
    let align = if wide { 8 } else { 4 };
    let pt2 = &elf.header.pt2;
    let (ph_min, sh_min) = if wide { (56, 64) } else { (32, 40) };
    let tables = [
        ("program", pt2.ph_offset(), pt2.ph_entry_size(), pt2.ph_count(), ph_min),
        ("section", pt2.sh_offset(), pt2.sh_entry_size(), pt2.sh_count(), sh_min),
    ];
    for (what, offset, entry_size, count, min_entry) in tables {
        if count == 0 {
            continue;
        }
        if entry_size < min_entry || u64::from(entry_size) % align != 0 || offset % align != 0 {
            return Err(bad(format!("malformed {} header table", what)));
        }
        region(data, offset, u64::from(entry_size) * u64::from(count))
            .map_err(|_| bad(format!("{} header table outside file", what)))?;
    }
    Ok(elf)
}

fn read_interpreter(elf: &ElfFile) -> Result<Option<String>> {
    for ph in elf.program_iter() {
        if let Ok(Type::Interp) = ph.get_type() {
            let bytes = region(elf.input, ph.offset(), ph.file_size())?;
            return Ok(c_str_at(bytes, 0));
        }
    }
    Ok(None)
}

fn section_bytes<'a>(elf: &ElfFile<'a>, sh: &SectionHeader<'a>) -> Result<&'a [u8]> {
    region(elf.input, sh.offset(), sh.size())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StringTag {
    Needed,
    RPath,
    RunPath,
}

/// Needed, RPATH and RUNPATH entries as (tag, string offset), up to DT_NULL.
/// Tags `xmas_elf` does not know are skipped.
macro_rules! string_entries {
    ($table:expr) => {{
        let mut found = Vec::new();
        for entry in $table.iter() {
            let kind = match entry.get_tag() {
                Ok(Tag::Null) => break,
                Ok(Tag::Needed) => StringTag::Needed,
                Ok(Tag::RPath) => StringTag::RPath,
                Ok(Tag::RunPath) => StringTag::RunPath,
                _ => continue,
            };
            found.push((kind, u64::from(entry.get_val().map_err(bad)?)));
        }
        found
    }};
}

pub fn parse_dynamic_info(data: &[u8]) -> Result<DynamicInfo> {
    let elf = open(data)?;
    let mut info = DynamicInfo {
        interpreter: read_interpreter(&elf)?,
        ..Default::default()
    };

    let sections: Vec<SectionHeader> = elf.section_iter().collect();
    let names = sections
        .get(elf.header.pt2.sh_str_index() as usize)
        .and_then(|sh| section_bytes(&elf, sh).ok());

    let mut dynstr = None;
    let mut dynamic = None;
    for (index, sh) in sections.iter().enumerate() {
        let name = names.and_then(|table| c_str_at(table, u64::from(sh.name())));
        if dynstr.is_none() && name.as_deref() == Some(".dynstr") {
            dynstr = Some(section_bytes(&elf, sh)?);
        }
        if dynamic.is_none() && matches!(sh.get_type(), Ok(ShType::Dynamic)) {
            dynamic = Some(index);
        }
    }

    // Static objects have no dynamic section and therefore no dependencies.
    let Some(dynamic) = dynamic.map(|index| &sections[index]) else {
        return Ok(info);
    };
    let strings = match dynstr {
        Some(table) => table,
        None => {
            let linked = sections
                .get(dynamic.link() as usize)
                .ok_or_else(|| bad("dynamic section without a string table"))?;
            section_bytes(&elf, linked)?
        }
    };

    let word: u64 = if data[4] == 2 { 8 } else { 4 };
    let table = section_bytes(&elf, dynamic)?;
    if table.len() as u64 % (word * 2) != 0 || dynamic.offset() % word != 0 {
        return Err(bad("malformed dynamic section"));
    }
    let entries = match dynamic.get_data(&elf).map_err(bad)? {
        SectionData::Dynamic64(table) => string_entries!(table),
        SectionData::Dynamic32(table) => string_entries!(table),
        _ => return Err(bad("dynamic section holds no dynamic entries")),
    };

    let mut runpath = Vec::new();
    let mut rpath = Vec::new();
    for (tag, offset) in entries {
        let text = c_str_at(strings, offset)
            .ok_or_else(|| bad(format!("string offset {} outside .dynstr", offset)))?;
        match tag {
            StringTag::Needed => info.needed.push(text),
            StringTag::RPath => rpath.extend(split_search_path(&text)),
            StringTag::RunPath => runpath.extend(split_search_path(&text)),
        }
    }
    info.search_paths = runpath.into_iter().chain(rpath).collect();
    Ok(info)
}

fn split_search_path(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(':').filter(|s| !s.is_empty()).map(str::to_string)
}

pub fn read_dynamic_info(path: &Path) -> Result<DynamicInfo> {
    let data = fs::read(path)
        .map_err(|e| bad(format!("cannot read {}: {}", path.display(), e)))?;
    parse_dynamic_info(&data).map_err(|e| match e {
        XprocError::Resolution(msg) => bad(format!("{}: {}", path.display(), msg)),
        other => other,
    })
}

/// Hand-assembled ELF objects for tests.
#[cfg(test)]
pub(crate) mod fixture {
    pub struct ElfSpec<'a> {
        pub sixty_four: bool,
        pub big_endian: bool,
        pub interp: Option<&'a str>,
        pub needed: &'a [&'a str],
        pub runpath: Option<&'a str>,
    }

    impl Default for ElfSpec<'_> {
        fn default() -> Self {
            Self {
                sixty_four: true,
                big_endian: false,
                interp: None,
                needed: &[],
                runpath: None,
            }
        }
    }

    struct Out {
        buf: Vec<u8>,
        big: bool,
        wide: bool,
    }

    impl Out {
        fn u16(&mut self, v: u16) {
            let b = if self.big { v.to_be_bytes() } else { v.to_le_bytes() };
            self.buf.extend_from_slice(&b);
        }
        fn u32(&mut self, v: u32) {
            let b = if self.big { v.to_be_bytes() } else { v.to_le_bytes() };
            self.buf.extend_from_slice(&b);
        }
        fn u64(&mut self, v: u64) {
            let b = if self.big { v.to_be_bytes() } else { v.to_le_bytes() };
            self.buf.extend_from_slice(&b);
        }
        fn word(&mut self, v: u64) {
            if self.wide {
                self.u64(v)
            } else {
                self.u32(v as u32)
            }
        }
    }

    fn pad_to(len: u64, align: u64) -> u64 {
        (len + align - 1) / align * align
    }

    /// Layout: header, optional PT_INTERP phdr, interp string, .dynstr,
    /// .dynamic, .shstrtab, then the section header table. Tables start on
    /// word boundaries.
    pub fn build(spec: &ElfSpec) -> Vec<u8> {
        let wide = spec.sixty_four;
        let ehsize: u64 = if wide { 64 } else { 52 };
        let phentsize: u64 = if wide { 56 } else { 32 };
        let shentsize: u64 = if wide { 64 } else { 40 };
        let word: u64 = if wide { 8 } else { 4 };

        let mut dynstr = vec![0u8];
        let mut entries = Vec::new();
        for name in spec.needed {
            entries.push((1u64, dynstr.len() as u64));
            dynstr.extend_from_slice(name.as_bytes());
            dynstr.push(0);
        }
        if let Some(path) = spec.runpath {
            entries.push((29u64, dynstr.len() as u64));
            dynstr.extend_from_slice(path.as_bytes());
            dynstr.push(0);
        }
        entries.push((0, 0));

        let shstrtab = b"\0.dynstr\0.dynamic\0.shstrtab\0".to_vec();
        let interp = spec.interp.map(|s| {
            let mut v = s.as_bytes().to_vec();
            v.push(0);
            v
        });

        let phnum: u64 = if interp.is_some() { 1 } else { 0 };
        let phoff = ehsize;
        let interp_off = phoff + phnum * phentsize;
        let interp_len = interp.as_ref().map_or(0, |v| v.len() as u64);
        let dynstr_off = interp_off + interp_len;
        let dynamic_off = pad_to(dynstr_off + dynstr.len() as u64, word);
        let dynamic_len = entries.len() as u64 * word * 2;
        let shstr_off = dynamic_off + dynamic_len;
        let shoff = pad_to(shstr_off + shstrtab.len() as u64, word);

        let mut o = Out {
            buf: Vec::new(),
            big: spec.big_endian,
            wide,
        };
        o.buf.extend_from_slice(&[0x7f, b'E', b'L', b'F']);
        o.buf.push(if wide { 2 } else { 1 });
        o.buf.push(if spec.big_endian { 2 } else { 1 });
        o.buf.push(1);
        o.buf.extend_from_slice(&[0u8; 9]);
        o.u16(3); // ET_DYN
        o.u16(if wide { 62 } else { 3 });
        o.u32(1);
        o.word(0); // entry
        o.word(if phnum > 0 { phoff } else { 0 });
        o.word(shoff);
        o.u32(0);
        o.u16(ehsize as u16);
        o.u16(phentsize as u16);
        o.u16(phnum as u16);
        o.u16(shentsize as u16);
        o.u16(4);
        o.u16(3);
        assert_eq!(o.buf.len() as u64, ehsize);

        if phnum > 0 {
            o.u32(3); // PT_INTERP
            if wide {
                o.u32(4);
                o.u64(interp_off);
                o.u64(0);
                o.u64(0);
                o.u64(interp_len);
                o.u64(interp_len);
                o.u64(1);
            } else {
                o.u32(interp_off as u32);
                o.u32(0);
                o.u32(0);
                o.u32(interp_len as u32);
                o.u32(interp_len as u32);
                o.u32(4);
                o.u32(1);
            }
        }
        if let Some(bytes) = &interp {
            o.buf.extend_from_slice(bytes);
        }
        o.buf.extend_from_slice(&dynstr);
        o.buf.resize(dynamic_off as usize, 0);
        for (tag, value) in &entries {
            o.word(*tag);
            o.word(*value);
        }
        o.buf.extend_from_slice(&shstrtab);
        o.buf.resize(shoff as usize, 0);

        let section = |o: &mut Out, name: u32, kind: u32, off: u64, size: u64, link: u32| {
            o.u32(name);
            o.u32(kind);
            o.word(0); // flags
            o.word(0); // addr
            o.word(off);
            o.word(size);
            o.u32(link);
            o.u32(0);
            o.word(1);
            o.word(0);
        };
        section(&mut o, 0, 0, 0, 0, 0);
        section(&mut o, 1, 3, dynstr_off, dynstr.len() as u64, 0);
        section(&mut o, 9, 6, dynamic_off, dynamic_len, 1);
        section(&mut o, 18, 3, shstr_off, shstrtab.len() as u64, 0);
        o.buf
    }
}
