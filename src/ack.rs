//! Builds HL7 acknowledgements (ACK/NAK) for received messages.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use log::debug;
use serde::Deserialize;

use crate::config::DefaultMsh;
use crate::error::AckGenerationError;
use crate::hl7::{find_segment, MshSegment, SEGMENT_DELIMITER};

// MSA-3 is an ST(80)
const MAX_TEXT_LEN: usize = 80;

/// The code carried in MSA-1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum AckCode {
    #[serde(rename = "AA")]
    ApplicationAccept,
    #[serde(rename = "AE")]
    ApplicationError,
    #[serde(rename = "AR")]
    ApplicationReject,
    #[serde(rename = "CA")]
    CommitAccept,
    #[serde(rename = "CE")]
    CommitError,
    #[serde(rename = "CR")]
    CommitReject,
}

impl AckCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckCode::ApplicationAccept => "AA",
            AckCode::ApplicationError => "AE",
            AckCode::ApplicationReject => "AR",
            AckCode::CommitAccept => "CA",
            AckCode::CommitError => "CE",
            AckCode::CommitReject => "CR",
        }
    }

    pub fn from_bytes(code: &[u8]) -> Option<Self> {
        match code {
            b"AA" => Some(AckCode::ApplicationAccept),
            b"AE" => Some(AckCode::ApplicationError),
            b"AR" => Some(AckCode::ApplicationReject),
            b"CA" => Some(AckCode::CommitAccept),
            b"CE" => Some(AckCode::CommitError),
            b"CR" => Some(AckCode::CommitReject),
            _ => None,
        }
    }

    /// Reads MSA-1 out of an acknowledgement message.
    pub fn from_acknowledgement(payload: &[u8]) -> Option<Self> {
        let msa = find_segment(payload, b"MSA")?;
        let separator = *msa.get(3)?;
        msa.split(|b| *b == separator)
            .nth(1)
            .and_then(AckCode::from_bytes)
    }

    /// Only application-level codes are ever generated here; commit codes belong to enhanced mode.
    pub fn is_application(&self) -> bool {
        matches!(
            self,
            AckCode::ApplicationAccept | AckCode::ApplicationError | AckCode::ApplicationReject
        )
    }
}

impl fmt::Display for AckCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An acknowledgement ready to be framed and written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acknowledgement {
    code: Option<AckCode>,
    payload: Bytes,
}

impl Acknowledgement {
    /// Wraps acknowledgement bytes supplied by the application, reading the code from MSA-1 if present.
    pub fn from_bytes(payload: Bytes) -> Self {
        let code = AckCode::from_acknowledgement(&payload);
        Acknowledgement { code, payload }
    }

    pub fn code(&self) -> Option<AckCode> {
        self.code
    }

    /// The unframed HL7 payload.
    pub fn as_bytes(&self) -> &Bytes {
        &self.payload
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Generates acknowledgements from the MSH of the message being acknowledged, or from the
/// configured [`DefaultMsh`] when there is no usable MSH.
#[derive(Debug, Clone)]
pub struct AckBuilder {
    default_msh: DefaultMsh,
}

impl AckBuilder {
    pub fn new(default_msh: DefaultMsh) -> Self {
        AckBuilder { default_msh }
    }

    /// Builds an acknowledgement answering `original`.
    ///
    /// The response MSH mirrors the original with sending and receiving application/facility
    /// swapped, MSH-9 replaced by `ACK^<trigger>^<structure>`, and MSH-10 onwards copied as-is.
    /// MSA-2 echoes the original control id.
    pub fn build(
        &self,
        original: &[u8],
        code: AckCode,
        text: Option<&str>,
    ) -> Result<Acknowledgement, AckGenerationError> {
        check_code(code)?;
        let msh = MshSegment::parse(original)?;
        let fs = msh.field_separator();

        let mut buf = BytesMut::with_capacity(msh.as_bytes().len() + 32);
        buf.put_slice(b"MSH");
        buf.put_u8(fs);
        buf.put_slice(msh.field(2).unwrap_or_default());
        for n in [5, 6, 3, 4, 7, 8] {
            buf.put_u8(fs);
            buf.put_slice(msh.field(n).unwrap_or_default());
        }

        buf.put_u8(fs);
        buf.put_slice(b"ACK");
        let message_type = msh.field(9).unwrap_or_default();
        match message_type
            .iter()
            .position(|b| *b == msh.component_separator())
        {
            Some(i) => buf.put_slice(&message_type[i..]),
            None => debug!("No component separator in MSH-9, acknowledging with a bare ACK"),
        }
        buf.put_slice(msh.raw_from(10));
        buf.put_u8(SEGMENT_DELIMITER);

        write_msa(&mut buf, fs, code, msh.control_id(), text);

        Ok(Acknowledgement {
            code: Some(code),
            payload: buf.freeze(),
        })
    }

    /// Builds an acknowledgement from the configured default header, for messages whose own
    /// header can't be used.
    pub fn build_fallback(
        &self,
        code: AckCode,
        text: Option<&str>,
    ) -> Result<Acknowledgement, AckGenerationError> {
        check_code(code)?;
        self.default_msh
            .validate()
            .map_err(AckGenerationError::InvalidDefaultMsh)?;

        let msh = &self.default_msh;
        let fs = msh.field_separator as u8;
        let timestamp = chrono::Local::now().format("%Y%m%d%H%M%S").to_string();

        let mut buf = BytesMut::with_capacity(128);
        buf.put_slice(b"MSH");
        for field in [
            msh.encoding_characters.as_str(),
            msh.sending_application.as_str(),
            msh.sending_facility.as_str(),
            msh.receiving_application.as_str(),
            msh.receiving_facility.as_str(),
            timestamp.as_str(),
            "",
            "ACK",
            "",
            msh.processing_id.as_str(),
            msh.version.as_str(),
        ] {
            buf.put_u8(fs);
            buf.put_slice(field.as_bytes());
        }
        buf.put_u8(SEGMENT_DELIMITER);

        write_msa(&mut buf, fs, code, &[], text);

        Ok(Acknowledgement {
            code: Some(code),
            payload: buf.freeze(),
        })
    }
}

fn check_code(code: AckCode) -> Result<(), AckGenerationError> {
    if code.is_application() {
        Ok(())
    } else {
        Err(AckGenerationError::UnsupportedCode(code.as_str()))
    }
}

fn write_msa(buf: &mut BytesMut, fs: u8, code: AckCode, control_id: &[u8], text: Option<&str>) {
    buf.put_slice(b"MSA");
    buf.put_u8(fs);
    buf.put_slice(code.as_str().as_bytes());
    buf.put_u8(fs);
    buf.put_slice(control_id);
    if let Some(text) = text.filter(|t| !t.is_empty()) {
        buf.put_u8(fs);
        // anything that would split the field or the segment is blanked out
        let cleaned: String = text
            .chars()
            .take(MAX_TEXT_LEN)
            .map(|c| {
                if c == fs as char || c == '\r' || c == '\n' {
                    ' '
                } else {
                    c
                }
            })
            .collect();
        buf.put_slice(cleaned.as_bytes());
    }
    buf.put_u8(SEGMENT_DELIMITER);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Hl7Error;

    const ADT_A04: &str = "MSH|^~\\&|APP_A|FAC_A|^org^sys||||ADT^A04^ADT_A04|||2.6\rPID|1||1100832^^^^PI||TEST^FIG\r";

    fn builder() -> AckBuilder {
        AckBuilder::new(DefaultMsh::default())
    }

    #[test]
    fn accept_swaps_sender_and_receiver() {
        let ack = builder()
            .build(ADT_A04.as_bytes(), AckCode::ApplicationAccept, None)
            .expect("ack");

        assert_eq!(
            ack.to_string_lossy(),
            "MSH|^~\\&|^org^sys||APP_A|FAC_A|||ACK^A04^ADT_A04|||2.6\rMSA|AA|\r"
        );
        assert_eq!(ack.code(), Some(AckCode::ApplicationAccept));
    }

    #[test]
    fn error_echoes_control_id_and_text() {
        let original = "MSH|^~\\&|EPIC|EPICADT|SMS|SMSADT|199912271408|CHARRIS|ADT^A04|1817457|D|2.5|\rPID||0493575\r";
        let ack = builder()
            .build(original.as_bytes(), AckCode::ApplicationError, Some("bad|pid\rsegment"))
            .expect("ack");

        assert_eq!(
            ack.to_string_lossy(),
            "MSH|^~\\&|SMS|SMSADT|EPIC|EPICADT|199912271408|CHARRIS|ACK^A04|1817457|D|2.5|\rMSA|AE|1817457|bad pid segment\r"
        );
    }

    #[test]
    fn bare_message_type_becomes_bare_ack() {
        let ack = builder()
            .build(b"MSH|^~\\&|A|B|C|D|||ADT|9|P|2.3", AckCode::ApplicationReject, None)
            .expect("ack");

        assert_eq!(ack.to_string_lossy(), "MSH|^~\\&|C|D|A|B|||ACK|9|P|2.3\rMSA|AR|9\r");
    }

    #[test]
    fn unparsable_header_is_a_generation_error() {
        let original = format!("MSH{}", ADT_A04);
        let err = builder()
            .build(original.as_bytes(), AckCode::ApplicationAccept, None)
            .expect_err("unparsable");

        assert_eq!(err, AckGenerationError::Header(Hl7Error::InvalidFieldSeparator(b'M')));
    }

    #[test]
    fn commit_codes_are_not_generated() {
        let err = builder()
            .build(ADT_A04.as_bytes(), AckCode::CommitAccept, None)
            .expect_err("commit code");
        assert_eq!(err, AckGenerationError::UnsupportedCode("CA"));
    }

    #[test]
    fn fallback_uses_default_header() {
        let msh = DefaultMsh {
            sending_application: "MLLP".into(),
            receiving_application: "UNKNOWN".into(),
            ..DefaultMsh::default()
        };
        let ack = AckBuilder::new(msh)
            .build_fallback(AckCode::ApplicationError, Some("unparsable message"))
            .expect("fallback ack");
        let text = ack.to_string_lossy();

        assert!(text.starts_with("MSH|^~\\&|MLLP||UNKNOWN||"), "{}", text);
        assert!(text.ends_with("||ACK||P|2.5\rMSA|AE||unparsable message\r"), "{}", text);
        assert_eq!(ack.code(), Some(AckCode::ApplicationError));
    }

    #[test]
    fn fallback_rejects_bad_configuration() {
        let msh = DefaultMsh {
            field_separator: 'X',
            ..DefaultMsh::default()
        };
        let err = AckBuilder::new(msh)
            .build_fallback(AckCode::ApplicationError, None)
            .expect_err("bad separator");

        assert!(matches!(err, AckGenerationError::InvalidDefaultMsh(_)));
    }

    #[test]
    fn reads_code_from_supplied_acknowledgement() {
        let ack = Acknowledgement::from_bytes(Bytes::from_static(b"MSH|^~\\&|A|B|C|D|||ACK|1|P|2.5\rMSA|CE|1\r"));
        assert_eq!(ack.code(), Some(AckCode::CommitError));

        let ack = Acknowledgement::from_bytes(Bytes::from_static(b"\x06"));
        assert_eq!(ack.code(), None);
    }
}
