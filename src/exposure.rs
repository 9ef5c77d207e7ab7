use crate::error::{CaptureError, Result};
use crate::hardware::{BracketConfig, BracketMode, ConfigPayload, PortIndex};
use tracing::debug;

/// Maximum number of exposure-bracketing values kept
pub const EXP_BRACKET_RANGE: usize = 10;

/// Fractional bits of the component's exposure fixed-point format
pub const Q16_OFFSET: u32 = 16;

/// Separator between values in a bracketing range string
pub const PARAMS_DELIMITER: char = ',';

/// Parse a delimited list of integers into `out`.
///
/// At most `out.len()` values are written; surplus tokens are dropped.
/// Empty tokens are skipped and each token is read like C `atoi` (leading
/// digits only, 0 when there are none). Returns the number of values written.
pub fn parse_exp_range(text: Option<&str>, out: Option<&mut [i32]>) -> Result<usize> {
    let text = text.ok_or_else(|| CaptureError::invalid_argument("exposure range string is null"))?;
    let out = out.ok_or_else(|| CaptureError::invalid_argument("exposure range output is null"))?;

    let mut valid = 0;
    for (slot, token) in out
        .iter_mut()
        .zip(text.split(PARAMS_DELIMITER).filter(|t| !t.is_empty()))
    {
        *slot = atoi(token);
        valid += 1;
    }

    debug!("Parsed {} exposure bracketing value(s) from {:?}", valid, text);
    Ok(valid)
}

fn atoi(token: &str) -> i32 {
    let trimmed = token.trim_start();
    let (negative, digits) = match trimmed.as_bytes().first() {
        Some(b'-') => (true, &trimmed[1..]),
        Some(b'+') => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };

    let magnitude = digits
        .bytes()
        .take_while(u8::is_ascii_digit)
        .fold(0i64, |acc, d| (acc * 10 + i64::from(d - b'0')).min(i64::from(i32::MAX) + 1));

    let value = if negative { -magnitude } else { magnitude };
    value.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}

/// Convert tenths of an EV step into the component's Q16 representation
pub fn ev_to_q16(tenths: i32) -> i32 {
    ((i64::from(tenths) * (1i64 << Q16_OFFSET)) / 10) as i32
}

/// Ordered exposure-compensation values with bounded capacity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExposureList {
    values: Vec<i32>,
}

impl ExposureList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a range string, silently keeping only the first
    /// [`EXP_BRACKET_RANGE`] values
    pub fn parse(text: &str) -> Self {
        let mut slots = [0i32; EXP_BRACKET_RANGE];
        let valid = parse_exp_range(Some(text), Some(&mut slots)).unwrap_or(0);
        Self {
            values: slots[..valid].to_vec(),
        }
    }

    pub fn as_slice(&self) -> &[i32] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Build the capture-mode and extended-capture-mode payloads for a
/// bracketing request.
///
/// With `count == 0 && frame_limit == 0` the port captures continuously and
/// bracketing is off. Otherwise capture is limited to `frame_limit` frames and,
/// when `count > 0`, bracketing runs over `count - 1` relative steps.
pub fn bracketing_payloads(
    port: PortIndex,
    values: Option<&[i32]>,
    count: usize,
    frame_limit: usize,
) -> Result<(ConfigPayload, ConfigPayload)> {
    let values = match values {
        Some(values) => values,
        None if count == 0 => &[],
        None => {
            return Err(CaptureError::invalid_argument(
                "exposure compensation values are missing",
            ))
        }
    };

    if values.len() < count {
        return Err(CaptureError::invalid_argument(format!(
            "{} exposure value(s) requested but only {} supplied",
            count,
            values.len()
        )));
    }

    let capture_mode = if count == 0 && frame_limit == 0 {
        ConfigPayload::CaptureMode {
            port,
            frame_limited: false,
            frame_limit: 0,
        }
    } else {
        ConfigPayload::CaptureMode {
            port,
            frame_limited: true,
            frame_limit,
        }
    };

    let bracketing = (count > 0).then(|| BracketConfig {
        mode: BracketMode::ExposureRelativeInEv,
        step_count: count - 1,
        values: values[..count].iter().map(|&v| ev_to_q16(v)).collect(),
    });

    Ok((
        capture_mode,
        ConfigPayload::ExtCaptureMode { port, bracketing },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_range() {
        let mut out = [0i32; 10];
        let valid = parse_exp_range(Some("100,-50,200"), Some(&mut out)).unwrap();
        assert_eq!(valid, 3);
        assert_eq!(&out[..3], &[100, -50, 200]);
    }

    #[test]
    fn test_parse_rejects_null_inputs_without_mutation() {
        let mut out = [7i32; 4];
        assert!(matches!(
            parse_exp_range(None, Some(&mut out)),
            Err(CaptureError::InvalidArgument { .. })
        ));
        assert_eq!(out, [7; 4]);

        assert!(matches!(
            parse_exp_range(Some("1,2"), None),
            Err(CaptureError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_parse_truncates_to_capacity() {
        let mut out = [0i32; 2];
        let valid = parse_exp_range(Some("1,2,3,4"), Some(&mut out)).unwrap();
        assert_eq!(valid, 2);
        assert_eq!(out, [1, 2]);
    }

    #[test]
    fn test_parse_is_lenient_like_atoi() {
        let mut out = [0i32; 5];
        let valid = parse_exp_range(Some(",12ev,, -3,abc,+4"), Some(&mut out)).unwrap();
        assert_eq!(valid, 4);
        assert_eq!(&out[..4], &[12, -3, 0, 4]);
    }

    #[test]
    fn test_parse_empty_string() {
        let mut out = [0i32; 3];
        assert_eq!(parse_exp_range(Some(""), Some(&mut out)).unwrap(), 0);
    }

    #[test]
    fn test_exposure_list_caps_length() {
        let list = ExposureList::parse("1,2,3,4,5,6,7,8,9,10,11,12");
        assert_eq!(list.len(), EXP_BRACKET_RANGE);
        assert_eq!(list.as_slice()[9], 10);
        assert!(ExposureList::parse("").is_empty());
    }

    #[test]
    fn test_q16_encoding() {
        assert_eq!(ev_to_q16(15), 98304);
        assert_eq!(ev_to_q16(-10), -65536);
        assert_eq!(ev_to_q16(0), 0);
    }

    #[test]
    fn test_unlimited_capture_when_nothing_requested() {
        let (mode, ext) = bracketing_payloads(PortIndex::IMAGE_OUT, None, 0, 0).unwrap();
        assert_eq!(
            mode,
            ConfigPayload::CaptureMode {
                port: PortIndex::IMAGE_OUT,
                frame_limited: false,
                frame_limit: 0
            }
        );
        assert_eq!(
            ext,
            ConfigPayload::ExtCaptureMode {
                port: PortIndex::IMAGE_OUT,
                bracketing: None
            }
        );
    }

    #[test]
    fn test_bracketing_steps_and_encoding() {
        let values = [-20, 0, 15];
        let (mode, ext) =
            bracketing_payloads(PortIndex::IMAGE_OUT, Some(&values), 3, 3).unwrap();

        assert!(matches!(
            mode,
            ConfigPayload::CaptureMode {
                frame_limited: true,
                frame_limit: 3,
                ..
            }
        ));
        match ext {
            ConfigPayload::ExtCaptureMode {
                bracketing: Some(config),
                ..
            } => {
                assert_eq!(config.step_count, 2);
                assert_eq!(config.values, vec![-131072, 0, 98304]);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_burst_without_bracketing() {
        let (mode, ext) = bracketing_payloads(PortIndex::IMAGE_OUT, Some(&[]), 0, 4).unwrap();
        assert!(matches!(
            mode,
            ConfigPayload::CaptureMode {
                frame_limited: true,
                frame_limit: 4,
                ..
            }
        ));
        assert!(matches!(
            ext,
            ConfigPayload::ExtCaptureMode {
                bracketing: None,
                ..
            }
        ));
    }

    #[test]
    fn test_missing_values_with_count_is_rejected() {
        assert!(bracketing_payloads(PortIndex::IMAGE_OUT, None, 2, 2).is_err());
    }
}
