//! Minimal ustar reader
//!
//! `bollard`'s `download_from_container` hands back a tar stream rather than
//! raw file bytes (the Docker API has no "give me one file" endpoint), so
//! harvesting the pcap means unwrapping that archive ourselves. Only what
//! the harvest path needs is implemented: walking entries and pulling out
//! the bytes of one by name.

const BLOCK_SIZE: usize = 512;

/// Return the contents of `path` inside a ustar archive, if present.
///
/// `path` is matched against the tar entry name with a leading `./` or `/`
/// stripped, since Docker's archive convention varies between a bare
/// relative name and one rooted at the requested directory.
pub fn extract_file(archive: &[u8], path: &str) -> Option<Vec<u8>> {
    let wanted = path.trim_start_matches("./").trim_start_matches('/');
    let mut offset = 0usize;

    while offset + BLOCK_SIZE <= archive.len() {
        let header = &archive[offset..offset + BLOCK_SIZE];
        if header.iter().all(|&b| b == 0) {
            break; // end-of-archive marker
        }

        let name = read_cstr(&header[0..100]);
        let size = read_octal(&header[124..136]);
        let typeflag = header[156];

        let data_start = offset + BLOCK_SIZE;
        let data_len = size.unwrap_or(0);
        let padded_len = data_len.div_ceil(BLOCK_SIZE) * BLOCK_SIZE;

        if (typeflag == b'0' || typeflag == 0) && name.trim_start_matches("./").trim_start_matches('/') == wanted {
            if data_start + data_len > archive.len() {
                return None; // truncated archive
            }
            return Some(archive[data_start..data_start + data_len].to_vec());
        }

        offset = data_start + padded_len;
    }

    None
}

fn read_cstr(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

fn read_octal(field: &[u8]) -> Option<usize> {
    let s = read_cstr(field);
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Some(0);
    }
    usize::from_str_radix(trimmed, 8).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_entry(name: &str, data: &[u8]) -> Vec<u8> {
        let mut header = vec![0u8; BLOCK_SIZE];
        header[0..name.len()].copy_from_slice(name.as_bytes());
        let size_octal = format!("{:011o}\0", data.len());
        header[124..124 + size_octal.len()].copy_from_slice(size_octal.as_bytes());
        header[156] = b'0';

        let mut entry = header;
        entry.extend_from_slice(data);
        let pad = data.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE - data.len();
        entry.extend(std::iter::repeat(0u8).take(pad));
        entry
    }

    #[test]
    fn test_extract_file_finds_matching_entry() {
        let mut archive = build_entry("netlog/log.pcap", b"pcap-bytes");
        archive.extend(std::iter::repeat(0u8).take(BLOCK_SIZE * 2));

        let found = extract_file(&archive, "netlog/log.pcap").unwrap();
        assert_eq!(found, b"pcap-bytes");
    }

    #[test]
    fn test_extract_file_returns_none_when_absent() {
        let mut archive = build_entry("other.txt", b"x");
        archive.extend(std::iter::repeat(0u8).take(BLOCK_SIZE * 2));

        assert!(extract_file(&archive, "netlog/log.pcap").is_none());
    }
}
