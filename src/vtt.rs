//! WebVTT segmentation
//!
//! Teams transcripts arrive as WebVTT with voice tags. This extracts the
//! speaker-segmented utterances and the counts the transcript row stores;
//! anything fancier belongs to downstream consumers.

use serde::Serialize;

/// One speaker utterance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Utterance {
    pub speaker: Option<String>,
    pub text: String,
    pub start: Option<String>,
    pub end: Option<String>,
}

/// Parsed transcript with the stats the store keeps.
#[derive(Debug, Clone, Default)]
pub struct ParsedVtt {
    pub utterances: Vec<Utterance>,
    pub word_count: i64,
    pub speaker_count: i64,
}

/// Segment a WebVTT document into utterances.
///
/// Tolerates cue identifiers, missing voice tags, and blank padding. Does
/// not attempt full spec conformance.
pub fn parse(vtt: &str) -> ParsedVtt {
    let mut utterances = Vec::new();
    let mut current_timing: Option<(String, String)> = None;

    for line in vtt.lines() {
        let line = line.trim();
        if line.is_empty() || line == "WEBVTT" || line.starts_with("NOTE") {
            current_timing = None;
            continue;
        }

        if let Some((start, end)) = parse_timing(line) {
            current_timing = Some((start, end));
            continue;
        }

        // cue identifiers sit alone between blank line and timing line
        if current_timing.is_none() {
            continue;
        }

        let (speaker, text) = split_voice_tag(line);
        if text.is_empty() {
            continue;
        }
        let (start, end) = current_timing.clone().unzip();
        utterances.push(Utterance {
            speaker,
            text,
            start,
            end,
        });
    }

    let word_count = utterances
        .iter()
        .map(|u| u.text.split_whitespace().count() as i64)
        .sum();
    let mut speakers: Vec<&str> = utterances
        .iter()
        .filter_map(|u| u.speaker.as_deref())
        .collect();
    speakers.sort_unstable();
    speakers.dedup();

    ParsedVtt {
        speaker_count: speakers.len() as i64,
        word_count,
        utterances,
    }
}

/// Render utterances as "Speaker: text" lines for the summarizer prompt.
pub fn to_plain_text(parsed: &ParsedVtt) -> String {
    parsed
        .utterances
        .iter()
        .map(|u| match &u.speaker {
            Some(speaker) => format!("{speaker}: {}", u.text),
            None => u.text.clone(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn parse_timing(line: &str) -> Option<(String, String)> {
    let (start, rest) = line.split_once("-->")?;
    let start = start.trim();
    // settings may follow the end timestamp
    let end = rest.trim().split_whitespace().next()?;
    if start.contains(':') && end.contains(':') {
        Some((start.to_string(), end.to_string()))
    } else {
        None
    }
}

/// Split `<v Display Name>text</v>` into speaker and text.
fn split_voice_tag(line: &str) -> (Option<String>, String) {
    let Some(rest) = line.strip_prefix("<v") else {
        return (None, line.to_string());
    };
    let Some((speaker, body)) = rest.split_once('>') else {
        return (None, line.to_string());
    };
    let speaker = speaker.trim().trim_start_matches('.').trim().to_string();
    let text = body.trim_end_matches("</v>").trim().to_string();
    let speaker = if speaker.is_empty() { None } else { Some(speaker) };
    (speaker, text)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "WEBVTT\n\n\
        1\n00:00:01.000 --> 00:00:04.000\n<v Alice Johnson>Good morning everyone.</v>\n\n\
        2\n00:00:04.500 --> 00:00:08.000\n<v Bob Lee>Morning. Shall we start?</v>\n\n\
        3\n00:00:08.500 --> 00:00:10.000\n<v Alice Johnson>Yes, first item.</v>\n";

    #[test]
    fn test_parse_voice_tags() {
        let parsed = parse(SAMPLE);
        assert_eq!(parsed.utterances.len(), 3);
        assert_eq!(parsed.speaker_count, 2);
        assert_eq!(parsed.utterances[0].speaker.as_deref(), Some("Alice Johnson"));
        assert_eq!(parsed.utterances[0].text, "Good morning everyone.");
        assert_eq!(parsed.utterances[0].start.as_deref(), Some("00:00:01.000"));
        assert_eq!(parsed.utterances[1].end.as_deref(), Some("00:00:08.000"));
    }

    #[test]
    fn test_word_count() {
        let parsed = parse(SAMPLE);
        // 3 + 4 + 3 words
        assert_eq!(parsed.word_count, 10);
    }

    #[test]
    fn test_cue_without_voice_tag() {
        let vtt = "WEBVTT\n\n00:00:01.000 --> 00:00:02.000\nplain caption text\n";
        let parsed = parse(vtt);
        assert_eq!(parsed.utterances.len(), 1);
        assert_eq!(parsed.utterances[0].speaker, None);
        assert_eq!(parsed.speaker_count, 0);
    }

    #[test]
    fn test_empty_and_garbage_input() {
        assert!(parse("").utterances.is_empty());
        assert!(parse("WEBVTT\n\n").utterances.is_empty());
        // text before any timing line is ignored
        assert!(parse("stray line\nanother\n").utterances.is_empty());
    }

    #[test]
    fn test_plain_text_rendering() {
        let parsed = parse(SAMPLE);
        let text = to_plain_text(&parsed);
        assert!(text.starts_with("Alice Johnson: Good morning everyone."));
        assert_eq!(text.lines().count(), 3);
    }
}
