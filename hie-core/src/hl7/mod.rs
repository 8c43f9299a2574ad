//! HL7 v2 ER7 parsing and acknowledgement generation (§4.4.4, §6.1). This is
//! deliberately not a general-purpose HL7 library: it extracts exactly the
//! fields the core needs (`MSH-3/4/9/10`, `MSA-1`) and nothing else, per
//! §1's "no eager parsing of payloads" non-goal.

pub mod reply_code;

const SEGMENT_TERM: char = '\r';
const FIELD_SEP: char = '|';
const COMPONENT_SEP: char = '^';

/// The subset of an HL7 v2 message's `MSH` segment this core cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MshFields {
    pub sending_application: String,
    pub sending_facility: String,
    pub receiving_application: String,
    pub receiving_facility: String,
    pub message_type: String,
    pub trigger_event: String,
    pub control_id: String,
}

impl MshFields {
    /// `MSH-9.1^MSH-9.2`, e.g. `ADT^A01` -- the trace header's
    /// `message_type` (§3.2).
    pub fn message_type_display(&self) -> String {
        if self.trigger_event.is_empty() {
            self.message_type.clone()
        } else {
            format!("{}^{}", self.message_type, self.trigger_event)
        }
    }
}

/// Split raw ER7 bytes into `\r`-terminated segments (last segment may be
/// unterminated; tolerated).
fn segments(raw: &[u8]) -> Vec<&str> {
    let text = std::str::from_utf8(raw).unwrap_or("");
    text.split(SEGMENT_TERM).filter(|s| !s.is_empty()).collect()
}

fn fields_of(segment: &str) -> Vec<&str> {
    segment.split(FIELD_SEP).collect()
}

/// Parse just the `MSH` segment. Returns `None` if the frame has no `MSH`
/// segment at all (a malformed frame, §4.1).
pub fn parse_msh(raw: &[u8]) -> Option<MshFields> {
    let segs = segments(raw);
    let msh = segs.iter().find(|s| s.starts_with("MSH"))?;
    // MSH is unusual: MSH-1 is the field separator itself, so
    // fields_of(msh)[0] == "MSH", [1] == encoding characters, [2] ==
    // sending application, etc. (one off from every other segment).
    let f = fields_of(msh);
    let get = |i: usize| f.get(i).copied().unwrap_or("").to_string();
    let msg_type_field = get(8);
    let (message_type, trigger_event) = match msg_type_field.split_once(COMPONENT_SEP) {
        Some((a, b)) => (a.to_string(), b.to_string()),
        None => (msg_type_field, String::new()),
    };
    Some(MshFields {
        sending_application: get(2),
        sending_facility: get(3),
        receiving_application: get(4),
        receiving_facility: get(5),
        message_type,
        trigger_event,
        control_id: get(9),
    })
}

/// Extract `MSA-1` (the acknowledgement code) from a response frame.
pub fn parse_msa_code(raw: &[u8]) -> Option<String> {
    let segs = segments(raw);
    let msa = segs.iter().find(|s| s.starts_with("MSA"))?;
    let f = fields_of(msa);
    f.get(1).map(|s| s.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckCode {
    /// Application Accept.
    Aa,
    /// Application Error.
    Ae,
    /// Application Reject.
    Ar,
    /// Commit-accept/error/reject (`use_ack_commit_codes`).
    Ca,
    Ce,
    Cr,
}

impl AckCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckCode::Aa => "AA",
            AckCode::Ae => "AE",
            AckCode::Ar => "AR",
            AckCode::Ca => "CA",
            AckCode::Ce => "CE",
            AckCode::Cr => "CR",
        }
    }
}

/// Build a minimal HL7 ACK for the frame described by `original`: reversed
/// sender/receiver, incremented control id, `MSA|<code>|<original control id>`
/// (§4.4.4).
pub fn build_ack(original: &MshFields, code: AckCode, new_control_id: &str) -> Vec<u8> {
    let msh = format!(
        "MSH|^~\\&|{recv_app}|{recv_fac}|{send_app}|{send_fac}|{ts}||ACK|{ctrl}|P|2.4",
        recv_app = original.receiving_application,
        recv_fac = original.receiving_facility,
        send_app = original.sending_application,
        send_fac = original.sending_facility,
        ts = crate::util::timestamp_compact(),
        ctrl = new_control_id,
    );
    let msa = format!("MSA|{}|{}", code.as_str(), original.control_id);
    format!("{msh}\r{msa}\r").into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    const S1_FRAME: &str = "MSH|^~\\&|PAS|HOSP|EPR|HOSP|20260213101500||ADT^A01|0001|P|2.4\rEVN||20260213101500\rPID|||NHS-1||SMITH^JOHN||19800101|M\r";

    #[test]
    fn parses_msh_fields_from_s1_scenario() {
        let msh = parse_msh(S1_FRAME.as_bytes()).unwrap();
        assert_eq!(msh.sending_application, "PAS");
        assert_eq!(msh.sending_facility, "HOSP");
        assert_eq!(msh.message_type, "ADT");
        assert_eq!(msh.trigger_event, "A01");
        assert_eq!(msh.control_id, "0001");
        assert_eq!(msh.message_type_display(), "ADT^A01");
    }

    #[test]
    fn parses_msa_code_from_ack() {
        let ack = "MSH|^~\\&|EPR|HOSP|PAS|HOSP|20260213101501||ACK|0002|P|2.4\rMSA|AA|0001\r";
        assert_eq!(parse_msa_code(ack.as_bytes()).as_deref(), Some("AA"));
    }

    #[test]
    fn build_ack_reverses_sender_and_receiver() {
        let msh = parse_msh(S1_FRAME.as_bytes()).unwrap();
        let ack = build_ack(&msh, AckCode::Aa, "9001");
        let text = String::from_utf8(ack).unwrap();
        assert!(text.starts_with("MSH|^~\\&|EPR|HOSP|PAS|HOSP|"));
        assert!(text.contains("MSA|AA|0001"));
    }

    #[test]
    fn missing_msh_returns_none() {
        assert!(parse_msh(b"PID|||1\r").is_none());
    }
}
