//! The saved sequence file.
//!
//! It is plain text: `#` lines are comments, every other non-blank line is
//! one command in wire format. A file is only accepted if the version marker
//! shows up before the first command.
//!
//! ```text
//! #filigree-version: 1
//! #command-count: 2
//! 0,4,0,2,20000
//! 1,7,1,0,0
//! ```

use crate::{decode_line, encode_line, Command, DecodeError};

pub const VERSION_MARKER: &str = "filigree-version";

const FILE_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    #[error("not a sequence file: no `filigree-version` header")]
    MissingVersion,
    #[error("line {line_no}: {source}")]
    BadLine {
        line_no: usize,
        #[source]
        source: DecodeError,
    },
}

/// Serializes a sequence, renumbering request ids to each command's position.
pub fn encode_sequence_file(commands: &[Command]) -> String {
    let mut out = format!(
        "#{VERSION_MARKER}: {FILE_VERSION}\n#command-count: {}\n",
        commands.len()
    );
    for (i, cmd) in commands.iter().enumerate() {
        out += &encode_line(&cmd.with_request_id(i as u32));
    }
    out
}

pub fn decode_sequence_file(text: &str) -> Result<Vec<Command>, FormatError> {
    let mut seen_version = false;
    let mut commands = Vec::new();

    for (i, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.contains(VERSION_MARKER) {
            seen_version = true;
        }
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if !seen_version {
            return Err(FormatError::MissingVersion);
        }
        let cmd = decode_line(line).map_err(|source| FormatError::BadLine {
            line_no: i + 1,
            source,
        })?;
        commands.push(cmd);
    }

    if seen_version {
        Ok(commands)
    } else {
        Err(FormatError::MissingVersion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CommandId;

    fn sample() -> Vec<Command> {
        vec![
            Command::new(CommandId::MotorsInitialize, 0, 0, 0.0).with_request_id(41),
            Command::new(CommandId::MotorAbsoluteMove, 0, 2, 20.0).with_request_id(7),
            Command::new(CommandId::MotorCutMove, 1, 0, -33.125).with_request_id(3),
            Command::new(CommandId::MotorDelay, 1, 0, 500.0).with_request_id(99),
        ]
    }

    #[test]
    fn header_and_renumbering() {
        let text = encode_sequence_file(&sample());
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("#filigree-version: 1"));
        assert_eq!(lines.next(), Some("#command-count: 4"));
        assert_eq!(lines.next(), Some("0,0,0,0,0"));
        assert_eq!(lines.next(), Some("1,4,0,2,20000"));
        assert_eq!(lines.next(), Some("2,6,1,0,-33125"));
        assert_eq!(lines.next(), Some("3,18,1,0,500"));
        assert_eq!(lines.next(), None);
    }

    #[test]
    fn file_round_trip() {
        let cmds = sample();
        let loaded = decode_sequence_file(&encode_sequence_file(&cmds)).unwrap();
        assert_eq!(loaded.len(), cmds.len());
        for (i, (a, b)) in loaded.iter().zip(&cmds).enumerate() {
            assert_eq!(a.request_id, i as u32);
            assert_eq!(a.command_id, b.command_id);
            assert_eq!(a.controller_id, b.controller_id);
            assert_eq!(a.motor_id, b.motor_id);
            assert_eq!(a.param, b.param);
        }
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let text = "\n# saved by hand\n#filigree-version: 1\n\n0,7,0,1,0\n   \n# trailing\n1,4,0,1,1500\n";
        let cmds = decode_sequence_file(text).unwrap();
        assert_eq!(cmds.len(), 2);
        assert_eq!(cmds[1].param, 1.5);
    }

    #[test]
    fn empty_sequence_is_fine() {
        assert_eq!(decode_sequence_file(&encode_sequence_file(&[])), Ok(vec![]));
    }

    #[test]
    fn missing_version_is_rejected() {
        assert_eq!(
            decode_sequence_file("#command-count: 1\n0,7,0,1,0\n"),
            Err(FormatError::MissingVersion)
        );
        assert_eq!(decode_sequence_file(""), Err(FormatError::MissingVersion));
    }

    #[test]
    fn version_after_data_is_too_late() {
        assert_eq!(
            decode_sequence_file("0,7,0,1,0\n#filigree-version: 1\n"),
            Err(FormatError::MissingVersion)
        );
    }

    #[test]
    fn bad_line_reports_its_number() {
        let err = decode_sequence_file("#filigree-version: 1\n0,7,0,1,0\nnonsense\n").unwrap_err();
        assert!(matches!(err, FormatError::BadLine { line_no: 3, .. }));
    }
}
