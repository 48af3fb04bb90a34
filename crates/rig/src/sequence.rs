use filigree_protocol::{decode_sequence_file, encode_sequence_file, Command, FormatError};

/// An editable list of recorded commands plus a cursor into it.
///
/// The cursor always points at an existing entry, or is 0 when the list
/// is empty.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Sequence {
    commands: Vec<Command>,
    cursor: usize,
}

impl Sequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_commands(commands: Vec<Command>) -> Self {
        Sequence {
            commands,
            cursor: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn get(&self, index: usize) -> Option<&Command> {
        self.commands.get(index)
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    fn clamp(&self, index: usize) -> usize {
        index.min(self.commands.len().saturating_sub(1))
    }

    pub fn set_cursor(&mut self, index: usize) {
        self.cursor = self.clamp(index);
    }

    /// Appends a command and moves the cursor onto it.
    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
        self.cursor = self.commands.len() - 1;
    }

    pub fn remove(&mut self, index: usize) -> Option<Command> {
        if index >= self.commands.len() {
            return None;
        }
        let removed = self.commands.remove(index);
        self.cursor = self.clamp(self.cursor);
        Some(removed)
    }

    pub fn replace(&mut self, commands: Vec<Command>) {
        self.commands = commands;
        self.cursor = 0;
    }

    pub fn clear(&mut self) {
        self.replace(Vec::new());
    }

    /// Replaces the whole sequence with a saved file's contents.
    ///
    /// On error the current sequence is left as it was.
    pub fn load(&mut self, text: &str) -> Result<(), FormatError> {
        let commands = decode_sequence_file(text)?;
        log::info!("loaded a sequence of {} commands", commands.len());
        self.replace(commands);
        Ok(())
    }

    pub fn to_file_text(&self) -> String {
        encode_sequence_file(&self.commands)
    }
}

#[cfg(test)]
mod tests {
    use filigree_protocol::CommandId;

    use super::*;

    fn mv(motor: u32, angle: f64) -> Command {
        Command::new(CommandId::MotorAbsoluteMove, 0, motor, angle)
    }

    #[test]
    fn cursor_stays_in_range() {
        let mut seq = Sequence::new();
        seq.set_cursor(4);
        assert_eq!(seq.cursor(), 0);

        seq.push(mv(0, 1.0));
        seq.push(mv(1, 2.0));
        seq.push(mv(2, 3.0));
        assert_eq!(seq.cursor(), 2);
        seq.set_cursor(10);
        assert_eq!(seq.cursor(), 2);

        assert_eq!(seq.remove(2), Some(mv(2, 3.0)));
        assert_eq!(seq.cursor(), 1);
        assert_eq!(seq.remove(5), None);
        seq.remove(0);
        seq.remove(0);
        assert!(seq.is_empty());
        assert_eq!(seq.cursor(), 0);
    }

    #[test]
    fn bad_file_leaves_the_sequence_alone() {
        let mut seq = Sequence::from_commands(vec![mv(0, 1.0), mv(1, 2.0)]);
        seq.set_cursor(1);
        let before = seq.clone();

        assert_eq!(
            seq.load("0,4,0,2,20000\n"),
            Err(FormatError::MissingVersion)
        );
        assert_eq!(seq, before);

        let err = seq
            .load("#filigree-version: 1\n0,4,0,2,20000\n1,4,oops\n")
            .unwrap_err();
        assert!(matches!(err, FormatError::BadLine { line_no: 3, .. }));
        assert_eq!(seq, before);
    }

    #[test]
    fn file_round_trip() {
        let mut seq = Sequence::from_commands(vec![
            mv(0, 12.345).with_request_id(90),
            Command::new(CommandId::MotorDelay, 1, 0, 500.0).with_request_id(3),
        ]);
        let text = seq.to_file_text();
        assert!(text.starts_with("#filigree-version: 1\n#command-count: 2\n"));

        seq.clear();
        seq.load(&text).unwrap();
        assert_eq!(seq.len(), 2);
        assert_eq!(seq.get(0), Some(&mv(0, 12.345)));
        assert_eq!(seq.get(1).map(|c| c.request_id), Some(1));
        assert_eq!(seq.get(1).map(|c| c.param), Some(500.0));
    }
}
