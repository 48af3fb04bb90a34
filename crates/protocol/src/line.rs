use crate::{Command, CommandId, FIELD_COUNT, MILLI_PER_DEGREE};

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("expected 5 integer fields, could only read {parsed} from {line:?}")]
    Short { line: String, parsed: usize },
    #[error("field {index} of {line:?} is out of range")]
    OutOfRange { line: String, index: usize },
}

/// Joins integer fields into a wire line, always exactly [`FIELD_COUNT`] wide.
///
/// Missing trailing fields are written as 0 and extra fields are dropped.
pub fn encode_fields(fields: &[i64]) -> String {
    let mut out = String::with_capacity(4 * FIELD_COUNT);
    for i in 0..FIELD_COUNT {
        if i != 0 {
            out.push(',');
        }
        out += &fields.get(i).copied().unwrap_or(0).to_string();
    }
    out.push('\n');
    out
}

pub fn encode_line(cmd: &Command) -> String {
    encode_fields(&cmd.wire_fields())
}

/// Parses as many leading integer fields as it can.
///
/// Stops at the first field that isn't an integer, so garbage input gives a
/// short (possibly empty) result rather than an error.
pub fn decode_fields(line: &str) -> Vec<i64> {
    line.trim()
        .split(',')
        .map(|field| field.trim().parse::<i64>())
        .take_while(Result::is_ok)
        .filter_map(Result::ok)
        .collect()
}

pub fn decode_line(line: &str) -> Result<Command, DecodeError> {
    let fields = decode_fields(line);
    if fields.len() < FIELD_COUNT {
        return Err(DecodeError::Short {
            line: line.trim().to_owned(),
            parsed: fields.len(),
        });
    }

    let id_field = |index: usize| {
        u32::try_from(fields[index]).map_err(|_| DecodeError::OutOfRange {
            line: line.trim().to_owned(),
            index,
        })
    };
    let command_id = id_field(1)?;
    let is_move = CommandId::from_u32(command_id).is_some_and(CommandId::is_move);
    let param = if is_move {
        fields[4] as f64 / MILLI_PER_DEGREE
    } else {
        fields[4] as f64
    };

    Ok(Command {
        request_id: id_field(0)?,
        command_id,
        controller_id: id_field(2)?,
        motor_id: id_field(3)?,
        param,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn absolute_move_is_sent_in_millidegrees() {
        let cmd = Command::new(CommandId::MotorAbsoluteMove, 0, 2, 20.0).with_request_id(5);
        assert_eq!(encode_line(&cmd), "5,4,0,2,20000\n");
        assert_eq!(decode_line("5,4,0,2,20000").unwrap(), cmd);
    }

    #[test]
    fn non_move_params_are_plain_integers() {
        let cmd = Command::new(CommandId::MotorSetVelocity, 1, 3, 250.0).with_request_id(9);
        assert_eq!(encode_line(&cmd), "9,10,1,3,250\n");
        assert_eq!(decode_line("9,10,1,3,250\r\n").unwrap(), cmd);
    }

    #[test]
    fn negative_relative_move() {
        let cmd = Command::new(CommandId::MotorRelativeMove, 0, 0, -12.5);
        assert_eq!(encode_line(&cmd), "0,5,0,0,-12500\n");
        assert_eq!(decode_line("0,5,0,0,-12500").unwrap().param, -12.5);
    }

    #[test]
    fn pads_and_truncates() {
        assert_eq!(encode_fields(&[7, 1]), "7,1,0,0,0\n");
        assert_eq!(encode_fields(&[]), "0,0,0,0,0\n");
        assert_eq!(encode_fields(&[1, 2, 3, 4, 5, 6, 7]), "1,2,3,4,5\n");
    }

    #[test]
    fn garbage_gives_partial_fields() {
        assert_eq!(decode_fields("1,2,x,4,5"), vec![1, 2]);
        assert_eq!(decode_fields("hello"), Vec::<i64>::new());
        assert!(matches!(
            decode_line("1,2,x,4,5"),
            Err(DecodeError::Short { parsed: 2, .. })
        ));
        assert!(matches!(
            decode_line("-1,0,0,0,0"),
            Err(DecodeError::OutOfRange { index: 0, .. })
        ));
    }

    proptest! {
        #[test]
        fn move_angles_round_trip(
            kind in prop::sample::select(vec![
                CommandId::MotorAbsoluteMove,
                CommandId::MotorRelativeMove,
                CommandId::MotorCutMove,
            ]),
            request_id: u32,
            controller_id in 0u32..4,
            motor_id in 0u32..8,
            milli in -10_000_000i64..10_000_000,
        ) {
            // Any angle with at most three decimals.
            let angle = milli as f64 / 1000.0;
            let cmd = Command::new(kind, controller_id, motor_id, angle).with_request_id(request_id);
            prop_assert_eq!(decode_line(&encode_line(&cmd)).unwrap(), cmd);
        }

        #[test]
        fn always_five_fields(fields in prop::collection::vec(any::<i64>(), 0..12)) {
            let line = encode_fields(&fields);
            prop_assert!(line.ends_with('\n'));
            prop_assert_eq!(line.trim_end().split(',').count(), FIELD_COUNT);
            let decoded = decode_fields(&line);
            for (i, value) in decoded.iter().enumerate() {
                prop_assert_eq!(*value, fields.get(i).copied().unwrap_or(0));
            }
        }
    }
}
