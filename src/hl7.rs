//! Just enough HL7 v2 to route and acknowledge a message.
//!
//! Only the MSH segment is interpreted. Everything else in a payload is passed through untouched,
//! including empty segments and stray line feeds.

use std::borrow::Cow;

use crate::error::Hl7Error;

/// CR, the separator between HL7 segments
pub const SEGMENT_DELIMITER: u8 = b'\r';

const MSH: &[u8] = b"MSH";
// MSH-9 is the last field we need to build an acknowledgement
const LAST_REQUIRED_FIELD: usize = 9;

fn is_segment_end(b: u8) -> bool {
    b == SEGMENT_DELIMITER || b == b'\n'
}

/// A borrowed view over the MSH segment at the start of a message.
///
/// Field numbers follow HL7 convention: MSH-1 is the field separator itself, MSH-2 the encoding
/// characters, MSH-3 the sending application and so on.
#[derive(Debug, Clone)]
pub struct MshSegment<'a> {
    segment: &'a [u8],
    field_separator: u8,
    component_separator: u8,
    // offsets of every field separator in `segment`, the first is always 3
    separators: Vec<usize>,
}

impl<'a> MshSegment<'a> {
    /// Locates and splits the MSH segment of `message`.
    ///
    /// Leading CR/LF bytes are skipped. Fails when the message doesn't start with `MSH`, the field
    /// separator is unusable, or the segment ends before MSH-9.
    pub fn parse(message: &'a [u8]) -> Result<Self, Hl7Error> {
        let start = message
            .iter()
            .position(|b| !is_segment_end(*b))
            .ok_or(Hl7Error::Empty)?;
        let message = &message[start..];

        if !message.starts_with(MSH) {
            return Err(Hl7Error::MissingMsh);
        }

        let field_separator = *message.get(MSH.len()).ok_or(Hl7Error::MissingField(1))?;
        if field_separator.is_ascii_alphanumeric() || is_segment_end(field_separator) {
            return Err(Hl7Error::InvalidFieldSeparator(field_separator));
        }

        let end = message
            .iter()
            .position(|b| is_segment_end(*b))
            .unwrap_or(message.len());
        let segment = &message[..end];

        let separators: Vec<usize> = segment
            .iter()
            .enumerate()
            .skip(MSH.len())
            .filter(|(_, b)| **b == field_separator)
            .map(|(i, _)| i)
            .collect();

        let mut msh = MshSegment {
            segment,
            field_separator,
            component_separator: b'^',
            separators,
        };

        msh.component_separator = match msh.field(2).and_then(|chars| chars.first()) {
            Some(c) => *c,
            None => return Err(Hl7Error::MissingEncodingCharacters),
        };

        // fields run through MSH-(separators + 1)
        if msh.separators.len() + 1 < LAST_REQUIRED_FIELD {
            return Err(Hl7Error::MissingField(msh.separators.len() + 2));
        }

        Ok(msh)
    }

    pub fn field_separator(&self) -> u8 {
        self.field_separator
    }

    pub fn component_separator(&self) -> u8 {
        self.component_separator
    }

    /// The complete MSH segment, without its terminator.
    pub fn as_bytes(&self) -> &'a [u8] {
        self.segment
    }

    /// Raw bytes of MSH-`n`, or `None` if the segment is too short to hold it.
    pub fn field(&self, n: usize) -> Option<&'a [u8]> {
        match n {
            0 => None,
            1 => Some(&self.segment[MSH.len()..=MSH.len()]),
            n => {
                let start = self.separators.get(n - 2)? + 1;
                let end = self
                    .separators
                    .get(n - 1)
                    .copied()
                    .unwrap_or(self.segment.len());
                Some(&self.segment[start..end])
            }
        }
    }

    /// MSH-`n` as text, treating missing and empty fields alike.
    pub fn field_str(&self, n: usize) -> Option<Cow<'a, str>> {
        self.field(n)
            .filter(|f| !f.is_empty())
            .map(String::from_utf8_lossy)
    }

    /// Component `c` (1-based) of MSH-`n`.
    pub fn component(&self, n: usize, c: usize) -> Option<&'a [u8]> {
        if c == 0 {
            return None;
        }
        self.field(n)?
            .split(|b| *b == self.component_separator)
            .nth(c - 1)
    }

    /// Everything from the separator in front of MSH-`n` to the end of the segment.
    pub(crate) fn raw_from(&self, n: usize) -> &'a [u8] {
        match n.checked_sub(2).and_then(|i| self.separators.get(i)) {
            Some(start) => &self.segment[*start..],
            None => &[],
        }
    }

    /// MSH-10, the message control id echoed back in MSA-2.
    pub fn control_id(&self) -> &'a [u8] {
        self.field(10).unwrap_or(&[])
    }
}

/// Routing metadata lifted from the MSH segment of a received message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Hl7Headers {
    pub sending_application: Option<String>,
    pub sending_facility: Option<String>,
    pub receiving_application: Option<String>,
    pub receiving_facility: Option<String>,
    pub timestamp: Option<String>,
    pub security: Option<String>,
    pub message_type: Option<String>,
    pub event_type: Option<String>,
    pub trigger_event: Option<String>,
    pub message_control_id: Option<String>,
    pub processing_id: Option<String>,
    pub version_id: Option<String>,
    pub charset: Option<String>,
}

impl Hl7Headers {
    pub fn from_msh(msh: &MshSegment<'_>) -> Self {
        let text = |n| msh.field_str(n).map(Cow::into_owned);
        let component = |c| {
            msh.component(9, c)
                .filter(|v| !v.is_empty())
                .map(|v| String::from_utf8_lossy(v).into_owned())
        };

        Hl7Headers {
            sending_application: text(3),
            sending_facility: text(4),
            receiving_application: text(5),
            receiving_facility: text(6),
            timestamp: text(7),
            security: text(8),
            message_type: text(9),
            event_type: component(1),
            trigger_event: component(2),
            message_control_id: text(10),
            processing_id: text(11),
            version_id: text(12),
            charset: text(18),
        }
    }
}

/// Returns the first segment of `payload` with the given three letter id.
pub fn find_segment<'a>(payload: &'a [u8], id: &[u8]) -> Option<&'a [u8]> {
    payload
        .split(|b| is_segment_end(*b))
        .find(|segment| segment.starts_with(id))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADT_A04: &[u8] =
        b"MSH|^~\\&|APP_A|FAC_A|^org^sys||20161206193919||ADT^A04^ADT_A04|CTRL-1|P|2.6||||||UNICODE UTF-8\rPID|1||1100832^^^^PI\r";

    #[test]
    fn parses_fields_by_hl7_number() {
        let msh = MshSegment::parse(ADT_A04).expect("valid MSH");

        assert_eq!(msh.field(1), Some(&b"|"[..]));
        assert_eq!(msh.field(2), Some(&b"^~\\&"[..]));
        assert_eq!(msh.field(3), Some(&b"APP_A"[..]));
        assert_eq!(msh.field(5), Some(&b"^org^sys"[..]));
        assert_eq!(msh.field(6), Some(&b""[..]));
        assert_eq!(msh.field(9), Some(&b"ADT^A04^ADT_A04"[..]));
        assert_eq!(msh.control_id(), b"CTRL-1");
        assert_eq!(msh.field(40), None);
    }

    #[test]
    fn segment_stops_at_first_delimiter() {
        let msh = MshSegment::parse(ADT_A04).expect("valid MSH");
        assert!(msh.as_bytes().ends_with(b"UNICODE UTF-8"));
    }

    #[test]
    fn raw_from_keeps_leading_separator() {
        let msh = MshSegment::parse(b"MSH|^~\\&|A|B|C|D|||ADT^A01|42|P|2.5").expect("valid MSH");
        assert_eq!(msh.raw_from(10), b"|42|P|2.5");
        assert_eq!(msh.raw_from(13), b"");
    }

    #[test]
    fn message_type_components() {
        let msh = MshSegment::parse(ADT_A04).expect("valid MSH");
        assert_eq!(msh.component(9, 1), Some(&b"ADT"[..]));
        assert_eq!(msh.component(9, 3), Some(&b"ADT_A04"[..]));
        assert_eq!(msh.component(9, 4), None);
    }

    #[test]
    fn tolerates_leading_line_endings() {
        let msh = MshSegment::parse(b"\r\nMSH|^~\\&|A|B|C|D|||ADT^A01").expect("valid MSH");
        assert_eq!(msh.field(3), Some(&b"A"[..]));
    }

    #[test]
    fn honours_alternate_separators() {
        let msh = MshSegment::parse(b"MSH#*~\\&#A#B#C#D###ORU*R01#7").expect("valid MSH");
        assert_eq!(msh.field_separator(), b'#');
        assert_eq!(msh.component_separator(), b'*');
        assert_eq!(msh.component(9, 2), Some(&b"R01"[..]));
    }

    #[test]
    fn rejects_doubled_segment_id() {
        let err = MshSegment::parse(b"MSHMSH|^~\\&|APP_A|FAC_A|^org^sys||||ADT^A04^ADT_A04|||2.6")
            .expect_err("alphanumeric field separator");
        assert_eq!(err, Hl7Error::InvalidFieldSeparator(b'M'));
    }

    #[test]
    fn rejects_non_msh_and_empty_messages() {
        assert_eq!(MshSegment::parse(b"PID|1").unwrap_err(), Hl7Error::MissingMsh);
        assert_eq!(MshSegment::parse(b"\r\n").unwrap_err(), Hl7Error::Empty);
        assert_eq!(MshSegment::parse(b"MSH").unwrap_err(), Hl7Error::MissingField(1));
        assert_eq!(
            MshSegment::parse(b"MSH||A").unwrap_err(),
            Hl7Error::MissingEncodingCharacters
        );
    }

    #[test]
    fn rejects_header_without_message_type() {
        let err = MshSegment::parse(b"MSH|^~\\&|A|B|C|D\rPID|").unwrap_err();
        assert_eq!(err, Hl7Error::MissingField(7));
    }

    #[test]
    fn extracts_routing_headers() {
        let msh = MshSegment::parse(ADT_A04).expect("valid MSH");
        let headers = Hl7Headers::from_msh(&msh);

        assert_eq!(headers.sending_application.as_deref(), Some("APP_A"));
        assert_eq!(headers.receiving_application.as_deref(), Some("^org^sys"));
        assert_eq!(headers.receiving_facility, None);
        assert_eq!(headers.event_type.as_deref(), Some("ADT"));
        assert_eq!(headers.trigger_event.as_deref(), Some("A04"));
        assert_eq!(headers.message_control_id.as_deref(), Some("CTRL-1"));
        assert_eq!(headers.version_id.as_deref(), Some("2.6"));
        assert_eq!(headers.charset.as_deref(), Some("UNICODE UTF-8"));
    }

    #[test]
    fn finds_segments_by_id() {
        assert_eq!(find_segment(ADT_A04, b"PID"), Some(&b"PID|1||1100832^^^^PI"[..]));
        assert_eq!(find_segment(ADT_A04, b"MSA"), None);
    }
}
