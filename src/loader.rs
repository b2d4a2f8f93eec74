//! Intel-HEX style image loader.

use std::io::BufRead;

use tracing::debug;

use crate::error::LoadError;
use crate::memory::Memory;

const RECORD_DATA: u8 = 0x00;
const RECORD_END: u8 = 0x01;

fn hex_field(text: &str, at: usize, digits: usize, line: usize) -> Result<u16, LoadError> {
    let field = text.get(at..at + digits).unwrap_or("");
    u16::from_str_radix(field, 16).map_err(|source| LoadError::BadHex { line, source })
}

/// Clear `memory` and write every data record from `reader` into it.
///
/// Returns the number of bytes written. Checksums are read past, not checked.
pub fn load_hex<M: Memory + ?Sized, R: BufRead>(memory: &mut M, reader: R) -> Result<usize, LoadError> {
    memory.clear();

    let mut written = 0;
    for (index, text) in reader.lines().enumerate() {
        let line = index + 1;
        let text = text.map_err(|err| LoadError::Io(err.to_string()))?;
        let text = text.trim_end();
        if text.is_empty() {
            continue;
        }
        if text.len() < 3 {
            return Err(LoadError::LineTooShort { line });
        }

        let count = hex_field(text, 1, 2, line)? as usize;
        // ':' + count + address + type + data + checksum
        if text.len() < 1 + 2 + 4 + 2 + count * 2 + 2 {
            return Err(LoadError::LineTooShort { line });
        }

        let mut address = hex_field(text, 3, 4, line)?;
        match hex_field(text, 7, 2, line)? as u8 {
            RECORD_DATA => {}
            RECORD_END => break,
            other => {
                debug!(line, record_type = other, "skipping hex record");
                continue;
            }
        }

        for k in 0..count {
            let byte = hex_field(text, 9 + k * 2, 2, line)? as u8;
            memory.store_byte(address, byte)?;
            address = address.wrapping_add(1);
            written += 1;
        }
    }

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::FlatMemory;

    #[test]
    fn test_load_data_records() {
        let image = ":0444000014531553DE\n:02440400FD3F82\n:00000001FF\n";
        let mut memory = FlatMemory::new();

        let written = load_hex(&mut memory, image.as_bytes()).unwrap();

        assert_eq!(written, 6);
        assert_eq!(memory.read(0x4400, 6).unwrap(), vec![0x14, 0x53, 0x15, 0x53, 0xFD, 0x3F]);
    }

    #[test]
    fn test_load_clears_memory_first() {
        let mut memory = FlatMemory::new();
        memory.store_byte(0x1000, 0xAA).unwrap();

        load_hex(&mut memory, ":0144000042FF\n".as_bytes()).unwrap();

        assert_eq!(memory.load_byte(0x1000).unwrap(), 0);
        assert_eq!(memory.load_byte(0x4400).unwrap(), 0x42);
    }

    #[test]
    fn test_end_record_stops_loading() {
        let image = ":00000001FF\n:0144000042FF\n";
        let mut memory = FlatMemory::new();

        assert_eq!(load_hex(&mut memory, image.as_bytes()).unwrap(), 0);
        assert_eq!(memory.load_byte(0x4400).unwrap(), 0);
    }

    #[test]
    fn test_other_record_types_are_skipped() {
        let image = ":020000040000FA\r\n\r\n:0144000042FF\r\n";
        let mut memory = FlatMemory::new();

        assert_eq!(load_hex(&mut memory, image.as_bytes()).unwrap(), 1);
        assert_eq!(memory.load_byte(0x4400).unwrap(), 0x42);
        assert_eq!(memory.load_byte(0x0000).unwrap(), 0);
    }

    #[test]
    fn test_short_line() {
        let mut memory = FlatMemory::new();

        assert_eq!(
            load_hex(&mut memory, ":0144000042FF\n:04440000\n".as_bytes()),
            Err(LoadError::LineTooShort { line: 2 })
        );
        assert_eq!(
            load_hex(&mut memory, ":0\n".as_bytes()),
            Err(LoadError::LineTooShort { line: 1 })
        );
    }

    #[test]
    fn test_bad_hex_digits() {
        let mut memory = FlatMemory::new();
        let result = load_hex(&mut memory, ":01440000ZZFF\n".as_bytes());

        assert!(matches!(result, Err(LoadError::BadHex { line: 1, .. })));
    }

    #[test]
    fn test_addresses_wrap() {
        let mut memory = FlatMemory::new();
        load_hex(&mut memory, ":02FFFF00AABBFF\n".as_bytes()).unwrap();

        assert_eq!(memory.load_byte(0xFFFF).unwrap(), 0xAA);
        assert_eq!(memory.load_byte(0x0000).unwrap(), 0xBB);
    }
}
