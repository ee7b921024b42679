//! Decodes the phone and card numbers a peripheral hides in its advertised service UUIDs.
//!
//! Two rules are tried per UUID, in advertisement order, and the first UUID that yields anything
//! wins:
//!
//! - literal segments: a standard `8-4-4-4-12` UUID whose first three segments start with an
//!   accepted prefix carries the phone in segments 1-3 and the card in segment 4;
//! - ASCII: otherwise the UUID's bytes are read as ASCII text and searched for a `010` phone
//!   number and an 8 to 16 digit card number.

use log::trace;

/// Length of the digit run that must follow the `010` phone prefix.
const PHONE_DIGITS_AFTER_PREFIX: usize = 8;

/// Prefix of a phone number embedded as ASCII text.
const ASCII_PHONE_PREFIX: &str = "010";

const CARD_MIN_DIGITS: usize = 8;
const CARD_MAX_DIGITS: usize = 16;

/// Phone and card recovered from an advertisement. Both absent when nothing matched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedIdentity {
    pub phone: Option<String>,
    pub card: Option<String>,
}

impl DecodedIdentity {
    pub fn is_empty(&self) -> bool {
        self.phone.is_none() && self.card.is_none()
    }
}

/// Tunables for [`decode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderConfig {
    /// Prefixes that mark the literal-segment phone candidate as real data.
    pub phone_prefixes: Vec<String>,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        DecoderConfig {
            phone_prefixes: vec!["010".to_string(), "1234".to_string()],
        }
    }
}

/// Decodes the identity carried by `uuids`. Never fails; no match yields an empty identity.
pub fn decode<S: AsRef<str>>(uuids: &[S], config: &DecoderConfig) -> DecodedIdentity {
    for uuid in uuids {
        let uuid = uuid.as_ref();
        if let Some(identity) = literal_segments(uuid, config) {
            trace!("UUID {uuid} matched the literal segment rule");
            return identity;
        }
        if let Some(identity) = ascii_text(uuid) {
            trace!("UUID {uuid} matched the ASCII rule");
            return identity;
        }
    }
    DecodedIdentity::default()
}

fn literal_segments(uuid: &str, config: &DecoderConfig) -> Option<DecodedIdentity> {
    let parts: Vec<&str> = uuid.split('-').collect();
    if parts.len() != 5 {
        return None;
    }
    let phone = format!("{}{}{}", parts[0], parts[1], parts[2]);
    if !config
        .phone_prefixes
        .iter()
        .any(|prefix| phone.starts_with(prefix.as_str()))
    {
        return None;
    }
    Some(DecodedIdentity {
        phone: non_empty(phone),
        card: non_empty(parts[3].to_string()),
    })
}

fn ascii_text(uuid: &str) -> Option<DecodedIdentity> {
    let bytes = hex::decode(uuid.replace('-', "")).ok()?;
    // Non-ASCII bytes are dropped, not replaced.
    let text: String = bytes
        .into_iter()
        .filter(u8::is_ascii)
        .map(char::from)
        .collect();

    let phone = find_phone(&text);
    let card = find_card(&text).filter(|card| phone.as_deref() != Some(card.as_str()));
    let identity = DecodedIdentity { phone, card };
    (!identity.is_empty()).then_some(identity)
}

/// First `010` followed by exactly eight digits.
fn find_phone(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    let len = ASCII_PHONE_PREFIX.len() + PHONE_DIGITS_AFTER_PREFIX;
    (0..bytes.len().checked_sub(len)? + 1)
        .find(|&start| {
            bytes[start..].starts_with(ASCII_PHONE_PREFIX.as_bytes())
                && bytes[start + ASCII_PHONE_PREFIX.len()..start + len]
                    .iter()
                    .all(u8::is_ascii_digit)
        })
        .map(|start| text[start..start + len].to_string())
}

/// First run of at least eight digits, truncated to sixteen.
fn find_card(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    let mut start = 0;
    while start < bytes.len() {
        if !bytes[start].is_ascii_digit() {
            start += 1;
            continue;
        }
        let run = bytes[start..]
            .iter()
            .take_while(|b| b.is_ascii_digit())
            .count();
        if run >= CARD_MIN_DIGITS {
            let end = start + run.min(CARD_MAX_DIGITS);
            return Some(text[start..end].to_string());
        }
        start += run;
    }
    None
}

fn non_empty(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Lays 16 ASCII bytes out as an `8-4-4-4-12` UUID.
    fn ascii_uuid(text: &str) -> String {
        assert_eq!(text.len(), 16, "test text must be 16 bytes");
        let hex = hex::encode(text);
        format!(
            "{}-{}-{}-{}-{}",
            &hex[0..8],
            &hex[8..12],
            &hex[12..16],
            &hex[16..20],
            &hex[20..32]
        )
    }

    fn decode_default(uuids: &[&str]) -> DecodedIdentity {
        decode(uuids, &DecoderConfig::default())
    }

    #[test]
    fn no_match_yields_empty_identity() {
        let identity = decode_default(&[
            "0000fff0-0000-1000-8000-00805f9b34fb",
            "0000180f-0000-1000-8000-00805f9b34fb",
            "2a00",
        ]);
        assert!(identity.is_empty());
        assert!(decode_default(&[]).is_empty());
    }

    #[test]
    fn literal_segments_with_accepted_prefix() {
        let identity = decode_default(&["12345678-9abc-def0-1234-56789abcdef0"]);
        assert_eq!(identity.phone.as_deref(), Some("123456789abcdef0"));
        assert_eq!(identity.card.as_deref(), Some("1234"));
    }

    #[test]
    fn literal_segments_with_010_prefix() {
        let identity = decode_default(&["01012345-6789-0000-5678-000000000000"]);
        assert_eq!(identity.phone.as_deref(), Some("0101234567890000"));
        assert_eq!(identity.card.as_deref(), Some("5678"));
    }

    #[test]
    fn prefixes_come_from_configuration() {
        let config = DecoderConfig {
            phone_prefixes: vec!["abcd".to_string()],
        };
        let identity = decode(&["abcd0000-1111-2222-3333-444444444444"], &config);
        assert_eq!(identity.phone.as_deref(), Some("abcd000011112222"));
        assert_eq!(identity.card.as_deref(), Some("3333"));

        let identity = decode(&["12345678-9abc-def0-1234-56789abcdef0"], &config);
        assert!(identity.is_empty());
    }

    #[test]
    fn ascii_phone_needs_exactly_eight_digits_after_prefix() {
        // Eight digits follow `010`: phone found; the digit run equals the phone so no card.
        let identity = decode_default(&[&ascii_uuid("ab01012345678cde")]);
        assert_eq!(identity.phone.as_deref(), Some("01012345678"));
        assert_eq!(identity.card, None);

        // Seven digits: no phone, but the ten digit run still counts as a card.
        let identity = decode_default(&[&ascii_uuid("ab0101234567xcde")]);
        assert_eq!(identity.phone, None);
        assert_eq!(identity.card.as_deref(), Some("0101234567"));
    }

    #[test]
    fn ascii_phone_ignores_trailing_digits() {
        let identity = decode_default(&[&ascii_uuid("a010123456789bcd")]);
        assert_eq!(identity.phone.as_deref(), Some("01012345678"));
        assert_eq!(identity.card.as_deref(), Some("010123456789"));
    }

    #[test]
    fn ascii_card_is_capped_at_sixteen_digits() {
        let identity = decode_default(&[&ascii_uuid("9876543210987654")]);
        assert_eq!(identity.phone, None);
        assert_eq!(identity.card.as_deref(), Some("9876543210987654"));

        let identity = decode_default(&[&ascii_uuid("x1234567yyyyyyyy")]);
        assert!(identity.is_empty());
    }

    #[test]
    fn prefix_gate_failure_falls_through_to_ascii_rule() {
        // Five segments, but the literal phone starts with "7878" and is rejected.
        let uuid = ascii_uuid("xx99887766554433");
        assert!(uuid.starts_with("7878"));
        let identity = decode_default(&[&uuid]);
        assert_eq!(identity.phone, None);
        assert_eq!(identity.card.as_deref(), Some("99887766554433"));
    }

    #[test]
    fn non_ascii_bytes_are_dropped() {
        // 0xff bytes vanish, joining the digits on either side into one run.
        let uuid = "30313233-ff34-3536-ff37-ffffffffffff";
        let identity = decode_default(&[uuid]);
        assert_eq!(identity.card.as_deref(), Some("01234567"));
    }

    #[test]
    fn malformed_hex_is_skipped() {
        let identity = decode_default(&[
            "zz-not-hex",
            "abc",
            "12345678-9abc-def0-1234-56789abcdef0",
        ]);
        assert_eq!(identity.phone.as_deref(), Some("123456789abcdef0"));
    }

    #[test]
    fn first_matching_uuid_wins() {
        let identity = decode_default(&[
            "0000fff0-0000-1000-8000-00805f9b34fb",
            &ascii_uuid("ab01099998888cde"),
            "12345678-9abc-def0-1234-56789abcdef0",
        ]);
        assert_eq!(identity.phone.as_deref(), Some("01099998888"));
        assert_eq!(identity.card, None);
    }
}
