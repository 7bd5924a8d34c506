//! String descriptor tables

use gadget::{StringTable, UsbString};
use tracing::debug;

use crate::usb::HostDevice;

/// Read every string the device offers, per supported language.
///
/// A device without a language list gets no tables. Within one language a
/// timeout ends the scan (the remaining indices would most likely time out
/// too), while any other failure or a malformed reply skips just that index.
pub fn read_string_tables<D: HostDevice + ?Sized>(device: &mut D) -> Vec<StringTable> {
    let languages = match device.read_string_descriptor(0, 0) {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!("No language list: {}", e);
            return Vec::new();
        }
    };

    if languages.len() < 4 || languages.len() % 2 != 0 {
        return Vec::new();
    }

    languages[2..]
        .chunks_exact(2)
        .map(|id| u16::from_le_bytes([id[0], id[1]]))
        .map(|language_id| StringTable {
            language_id,
            strings: read_language(device, language_id),
        })
        .collect()
}

fn read_language<D: HostDevice + ?Sized>(device: &mut D, language_id: u16) -> Vec<UsbString> {
    let mut strings = Vec::new();

    for index in 1..=255u8 {
        let bytes = match device.read_string_descriptor(index, language_id) {
            Ok(bytes) => bytes,
            Err(rusb::Error::Timeout) => break,
            Err(_) => continue,
        };

        let Some(text) = decode_string_descriptor(&bytes) else {
            continue;
        };

        debug!("string ({:#06x}, {}) = {}", language_id, index, text);
        strings.push(UsbString { index, text });
    }

    strings
}

/// Decode a raw string descriptor (2-byte header, UTF-16LE body)
pub fn decode_string_descriptor(bytes: &[u8]) -> Option<String> {
    if bytes.len() < 2 || bytes.len() % 2 != 0 {
        return None;
    }

    let units: Vec<u16> = bytes[2..]
        .chunks_exact(2)
        .map(|unit| u16::from_le_bytes([unit[0], unit[1]]))
        .collect();

    Some(String::from_utf16_lossy(&units))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeDevice, string_descriptor};

    #[test]
    fn test_decode() {
        assert_eq!(
            decode_string_descriptor(&string_descriptor("Wé")).as_deref(),
            Some("Wé")
        );
        assert_eq!(decode_string_descriptor(&[0x02, 0x03]).as_deref(), Some(""));
        assert_eq!(decode_string_descriptor(&[0x03]), None);
        assert_eq!(decode_string_descriptor(&[0x05, 0x03, 0x41]), None);
    }

    #[test]
    fn test_timeout_stops_language_scan() {
        let mut device = FakeDevice::new();
        {
            let mut state = device.state.borrow_mut();
            state.set_string(0, 0, Ok(vec![0x06, 0x03, 0x09, 0x04, 0x07, 0x04]));
            state.set_string(1, 0x0409, Ok(string_descriptor("Acme")));
            state.set_string(2, 0x0409, Ok(string_descriptor("Widget")));
            state.set_string(3, 0x0409, Err(rusb::Error::Timeout));
            state.set_string(4, 0x0409, Ok(string_descriptor("unreachable")));
            state.set_string(1, 0x0407, Ok(string_descriptor("Acme GmbH")));
        }

        let tables = read_string_tables(&mut device);

        assert_eq!(tables.len(), 2);
        assert_eq!(tables[0].language_id, 0x0409);
        assert_eq!(tables[0].strings.len(), 2);
        assert_eq!(tables[0].get(2), Some("Widget"));
        assert_eq!(tables[0].get(4), None);
        assert_eq!(tables[1].language_id, 0x0407);
        assert_eq!(tables[1].get(1), Some("Acme GmbH"));

        // The scan of 0x0409 never went past the timeout
        let reads = device.state.borrow().string_reads.clone();
        assert!(!reads.contains(&(4, 0x0409)));
        assert!(reads.contains(&(255, 0x0407)));
    }

    #[test]
    fn test_malformed_reply_skips_one_index() {
        let mut device = FakeDevice::new();
        {
            let mut state = device.state.borrow_mut();
            state.set_string(0, 0, Ok(vec![0x04, 0x03, 0x09, 0x04]));
            state.set_string(1, 0x0409, Ok(vec![0x03, 0x03, 0x41]));
            state.set_string(2, 0x0409, Ok(vec![0x03]));
            state.set_string(3, 0x0409, Ok(string_descriptor("Serial")));
            state.set_string(4, 0x0409, Err(rusb::Error::Pipe));
            state.set_string(5, 0x0409, Ok(string_descriptor("Config")));
        }

        let tables = read_string_tables(&mut device);

        let indices: Vec<u8> = tables[0].strings.iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![3, 5]);
    }

    #[test]
    fn test_missing_language_list() {
        let mut device = FakeDevice::new();
        device
            .state
            .borrow_mut()
            .set_string(0, 0, Ok(vec![0x02, 0x03]));

        assert!(read_string_tables(&mut device).is_empty());
    }
}
