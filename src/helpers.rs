use std::fmt;

/// Wifi signal strength buckets (dB SNR as reported by the meter's
/// controller). A boundary value belongs to the next bucket up.
const SIGNAL_LIMITS: [i32; 3] = [1, 12, 17];

/// Qualitative wifi signal classification exposed to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalQuality {
    Offline,
    Bad,
    Good,
    VeryGood,
}

impl SignalQuality {
    /// Classifies a raw signal value; a missing value means the meter's
    /// controller is offline.
    pub fn classify(value: Option<i32>) -> Self {
        match value {
            None => SignalQuality::Offline,
            Some(v) if v < SIGNAL_LIMITS[0] => SignalQuality::Offline,
            Some(v) if v < SIGNAL_LIMITS[1] => SignalQuality::Bad,
            Some(v) if v < SIGNAL_LIMITS[2] => SignalQuality::Good,
            Some(_) => SignalQuality::VeryGood,
        }
    }
}

impl fmt::Display for SignalQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SignalQuality::Offline => "offline",
            SignalQuality::Bad => "bad",
            SignalQuality::Good => "good",
            SignalQuality::VeryGood => "very_good",
        };
        f.write_str(text)
    }
}

/// Formats a raw controller id as a MAC address: left-pad to 12 hex digits,
/// lowercase, colon-separated pairs. Ids longer than 12 digits keep only
/// the first 12.
pub fn format_mac(raw: &str) -> String {
    let padded = format!("{:0>12}", raw.to_ascii_lowercase());
    padded
        .as_bytes()
        .chunks(2)
        .take(6)
        .map(|pair| String::from_utf8_lossy(pair).into_owned())
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_mac_pads_short_ids() {
        assert_eq!(format_mac("aabb"), "00:00:00:00:aa:bb");
        assert_eq!(format_mac("1"), "00:00:00:00:00:01");
    }

    #[test]
    fn test_format_mac_full_length() {
        assert_eq!(format_mac("A1B2C3D4E5F6"), "a1:b2:c3:d4:e5:f6");
    }

    #[test]
    fn test_format_mac_truncates_long_ids() {
        assert_eq!(format_mac("1234567890abc"), "12:34:56:78:90:ab");
        assert_eq!(format_mac("A1B2C3D4E5F6FF"), "a1:b2:c3:d4:e5:f6");
    }

    #[test]
    fn test_signal_classification_boundaries() {
        assert_eq!(SignalQuality::classify(None), SignalQuality::Offline);
        assert_eq!(SignalQuality::classify(Some(0)), SignalQuality::Offline);
        // Boundary values belong to the next bucket up.
        assert_eq!(SignalQuality::classify(Some(1)), SignalQuality::Bad);
        assert_eq!(SignalQuality::classify(Some(11)), SignalQuality::Bad);
        assert_eq!(SignalQuality::classify(Some(12)), SignalQuality::Good);
        assert_eq!(SignalQuality::classify(Some(16)), SignalQuality::Good);
        assert_eq!(SignalQuality::classify(Some(17)), SignalQuality::VeryGood);
        assert_eq!(SignalQuality::classify(Some(99)), SignalQuality::VeryGood);
    }

    #[test]
    fn test_signal_display_text() {
        assert_eq!(SignalQuality::VeryGood.to_string(), "very_good");
        assert_eq!(SignalQuality::Offline.to_string(), "offline");
    }
}
