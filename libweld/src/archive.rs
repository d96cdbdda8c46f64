//! Minimal `ar` archive reader. We only need to enumerate members; symbol
//! table members are skipped since archive member selection is driven by our
//! own resolution pass.

use crate::error::Context;
use crate::error::Result;
use crate::error::bail;

pub(crate) const MAGIC: &[u8] = b"!<arch>\n";

const HEADER_SIZE: usize = 60;

pub(crate) struct ArchiveMember<'data> {
    pub(crate) name: String,
    pub(crate) data: &'data [u8],
}

pub(crate) fn is_archive(data: &[u8]) -> bool {
    data.starts_with(MAGIC)
}

/// Splits an archive into its members, resolving long names via the `//`
/// member. Special members (`/`, `/SYM64/`, `//`) are consumed but not
/// returned.
pub(crate) fn split_members<'data>(data: &'data [u8]) -> Result<Vec<ArchiveMember<'data>>> {
    let mut members = Vec::new();
    let mut long_names: &'data [u8] = &[];
    let mut pos = MAGIC.len();

    while pos + HEADER_SIZE <= data.len() {
        let header = &data[pos..pos + HEADER_SIZE];
        if &header[58..60] != b"`\n" {
            bail!("malformed archive member header at offset {pos}");
        }
        let size: usize = parse_decimal(&header[48..58]).context("bad archive member size")?;
        let body_start = pos + HEADER_SIZE;
        if body_start + size > data.len() {
            bail!("archive member at offset {pos} extends past end of file");
        }
        let body = &data[body_start..body_start + size];
        let raw_name = trim_ascii(&header[0..16]);

        match raw_name {
            b"/" | b"/SYM64/" => {}
            b"//" => long_names = body,
            _ => {
                let name = member_name(raw_name, long_names)?;
                members.push(ArchiveMember { name, data: body });
            }
        }

        // Member bodies are padded to an even offset.
        pos = body_start + size + (size & 1);
    }

    Ok(members)
}

fn member_name(raw: &[u8], long_names: &[u8]) -> Result<String> {
    let name = if let Some(rest) = raw.strip_prefix(b"/") {
        // An offset into the long-name table. Entries there end with "/\n".
        let offset: usize = parse_decimal(rest).context("bad long name offset")?;
        if offset >= long_names.len() {
            bail!("long name offset {offset} out of bounds");
        }
        let entry = &long_names[offset..];
        let end = entry
            .iter()
            .position(|&b| b == b'\n')
            .unwrap_or(entry.len());
        entry[..end].strip_suffix(b"/").unwrap_or(&entry[..end])
    } else {
        raw.strip_suffix(b"/").unwrap_or(raw)
    };
    Ok(String::from_utf8_lossy(name).into_owned())
}

fn parse_decimal(field: &[u8]) -> Result<usize> {
    let s = core::str::from_utf8(trim_ascii(field))?;
    Ok(s.parse()?)
}

fn trim_ascii(mut bytes: &[u8]) -> &[u8] {
    while let Some((&last, rest)) = bytes.split_last() {
        if last == b' ' || last == b'\n' || last == b'\0' {
            bytes = rest;
        } else {
            break;
        }
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(name: &str, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(format!("{name:<16}").as_bytes());
        out.extend_from_slice(format!("{:<12}", 0).as_bytes());
        out.extend_from_slice(format!("{:<6}", 0).as_bytes());
        out.extend_from_slice(format!("{:<6}", 0).as_bytes());
        out.extend_from_slice(format!("{:<8}", 644).as_bytes());
        out.extend_from_slice(format!("{:<10}", body.len()).as_bytes());
        out.extend_from_slice(b"`\n");
        out.extend_from_slice(body);
        if body.len() & 1 == 1 {
            out.push(b'\n');
        }
        out
    }

    #[test]
    fn splits_members_and_resolves_long_names() {
        let mut data = MAGIC.to_vec();
        data.extend(member("a.o/", b"AAA"));
        data.extend(member("//", b"very_long_member_name.o/\n"));
        data.extend(member("/0", b"BB"));
        let members = split_members(&data).unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].name, "a.o");
        assert_eq!(members[0].data, b"AAA");
        assert_eq!(members[1].name, "very_long_member_name.o");
        assert_eq!(members[1].data, b"BB");
    }

    #[test]
    fn rejects_truncated_member() {
        let mut data = MAGIC.to_vec();
        let mut m = member("a.o/", b"AAA");
        m.truncate(m.len() - 2);
        data.extend(m);
        assert!(split_members(&data).is_err());
    }
}
