//! G-code tokenizer and command parser.
//!
//! `GCodeParser` splits a line into span-tracked words, comments, line numbers
//! and checksums. `ParsedCommand` builds on it to produce the
//! `(command, parameters, comment)` triple the position tracker consumes and
//! renders it back in the firmware's canonical form.

use async_stream::stream;
use futures_core::stream::Stream;
use futures_util::io::AsyncBufRead;
use std::fmt::Write as _;
use std::ops::Range;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GCodeSpan {
    pub range: Range<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GCodeCommand<'a> {
    Word { letter: char, value: &'a str, span: GCodeSpan },
    Comment(&'a str, GCodeSpan),
    LineNumber { number: u64, span: GCodeSpan },
    Checksum { checksum: u8, span: GCodeSpan },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message} (at {span:?})")]
pub struct GCodeError {
    pub message: String,
    pub span: GCodeSpan,
}

impl GCodeError {
    fn new(message: impl Into<String>, range: Range<usize>) -> Self {
        Self { message: message.into(), span: GCodeSpan { range } }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GCodeParserConfig {
    pub enable_comments: bool,
    pub enable_checksums: bool,
}

impl Default for GCodeParserConfig {
    fn default() -> Self {
        Self {
            enable_comments: true,
            enable_checksums: true,
        }
    }
}

pub struct GCodeParser<'a> {
    input: &'a str,
    config: GCodeParserConfig,
    pos: usize,
}

impl<'a> GCodeParser<'a> {
    pub fn new(input: &'a str, config: GCodeParserConfig) -> Self {
        Self { input, config, pos: 0 }
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> &'a str {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if !pred(c) {
                break;
            }
            self.pos += c.len_utf8();
        }
        &self.input[start..self.pos]
    }

    fn is_number_char(c: char) -> bool {
        c.is_ascii_digit() || c == '.' || c == '-' || c == '+'
    }

    pub fn next_command(&mut self) -> Option<Result<GCodeCommand<'a>, GCodeError>> {
        self.take_while(char::is_whitespace);
        let start = self.pos;
        let c = self.peek()?;
        match c {
            ';' if self.config.enable_comments => {
                self.pos += 1;
                let comment = self.take_while(|c| c != '\n');
                Some(Ok(GCodeCommand::Comment(comment.trim(), GCodeSpan { range: start..self.pos })))
            }
            '*' if self.config.enable_checksums => {
                self.pos += 1;
                let digits = self.take_while(|c| c.is_ascii_digit());
                match digits.parse::<u8>() {
                    Ok(checksum) => Some(Ok(GCodeCommand::Checksum { checksum, span: GCodeSpan { range: start..self.pos } })),
                    Err(_) => Some(Err(GCodeError::new(format!("Invalid checksum: '{}'", digits), start..self.pos))),
                }
            }
            'N' | 'n' if self.config.enable_checksums => {
                self.pos += 1;
                let digits = self.take_while(|c| c.is_ascii_digit());
                match digits.parse::<u64>() {
                    Ok(number) => Some(Ok(GCodeCommand::LineNumber { number, span: GCodeSpan { range: start..self.pos } })),
                    Err(_) => Some(Err(GCodeError::new(format!("Invalid line number: '{}'", digits), start..self.pos))),
                }
            }
            _ if c.is_ascii_alphabetic() => {
                self.pos += 1;
                let value = self.take_while(Self::is_number_char);
                Some(Ok(GCodeCommand::Word {
                    letter: c.to_ascii_uppercase(),
                    value,
                    span: GCodeSpan { range: start..self.pos },
                }))
            }
            _ => {
                // Skip to the next whitespace so the caller can keep going.
                self.take_while(|c| !c.is_whitespace());
                Some(Err(GCodeError::new(format!("Unexpected character: {}", c), start..self.pos)))
            }
        }
    }
}

/// Commands whose remainder is free text rather than parameters.
const TEXT_COMMANDS: &[&str] = &["M23", "M28", "M30", "M32", "M117", "M118"];

/// A single interpreted command line.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCommand {
    /// Canonical command token, e.g. `G1`, `M83`, `T0`.
    pub command: String,
    pub parameters: Vec<(char, Option<f64>)>,
    pub text: Option<String>,
    pub comment: Option<String>,
}

impl ParsedCommand {
    pub fn parse(raw: &str) -> Result<Self, GCodeError> {
        let mut parser = GCodeParser::new(raw, GCodeParserConfig::default());
        let mut command: Option<String> = None;
        let mut parameters = Vec::new();
        let mut text = None;
        let mut comment = None;

        while let Some(item) = parser.next_command() {
            match item? {
                GCodeCommand::LineNumber { .. } | GCodeCommand::Checksum { .. } => {}
                GCodeCommand::Comment(c, _) => comment = Some(c.to_string()),
                GCodeCommand::Word { letter, value, span } => {
                    if command.is_none() {
                        command = Some(command_token(letter, value, span.range.clone())?);
                        if command.as_deref().is_some_and(|c| TEXT_COMMANDS.contains(&c)) {
                            let (body, trailing) = split_comment(&raw[span.range.end..]);
                            let body = strip_checksum(body).trim();
                            if !body.is_empty() {
                                text = Some(body.to_string());
                            }
                            comment = trailing.map(str::to_string);
                            break;
                        }
                        continue;
                    }
                    let parsed = if value.is_empty() {
                        None
                    } else {
                        Some(value.parse::<f64>().map_err(|_| {
                            GCodeError::new(format!("Invalid value for {}: '{}'", letter, value), span.range.clone())
                        })?)
                    };
                    parameters.push((letter, parsed));
                }
            }
        }

        let command = command.ok_or_else(|| GCodeError::new("No command found", 0..raw.len()))?;
        Ok(Self { command, parameters, text, comment })
    }

    /// Value of a parameter if it is present and carries a number.
    pub fn parameter(&self, letter: char) -> Option<f64> {
        self.parameters
            .iter()
            .find(|(l, _)| *l == letter)
            .and_then(|(_, v)| *v)
    }

    pub fn has_parameter(&self, letter: char) -> bool {
        self.parameters.iter().any(|(l, _)| *l == letter)
    }

    pub fn is(&self, command: &str) -> bool {
        self.command == command
    }

    /// Renders the canonical firmware form: uppercase token, parameters in
    /// their original order, optional `;comment` suffix.
    pub fn to_gcode(&self) -> String {
        let mut out = self.command.clone();
        for (letter, value) in &self.parameters {
            out.push(' ');
            out.push(*letter);
            if let Some(v) = value {
                let _ = write!(out, "{}", v);
            }
        }
        if let Some(text) = &self.text {
            out.push(' ');
            out.push_str(text);
        }
        if let Some(comment) = &self.comment {
            out.push_str(" ;");
            out.push_str(comment);
        }
        out
    }
}

fn command_token(letter: char, value: &str, range: Range<usize>) -> Result<String, GCodeError> {
    if !matches!(letter, 'G' | 'M' | 'T') {
        return Err(GCodeError::new(format!("Not a command word: {}{}", letter, value), range));
    }
    let number: f64 = value
        .parse()
        .map_err(|_| GCodeError::new(format!("Invalid command number: {}{}", letter, value), range))?;
    if number.fract() == 0.0 {
        Ok(format!("{}{}", letter, number as i64))
    } else {
        Ok(format!("{}{}", letter, number))
    }
}

fn split_comment(line: &str) -> (&str, Option<&str>) {
    match line.find(';') {
        Some(idx) => (&line[..idx], Some(line[idx + 1..].trim())),
        None => (line, None),
    }
}

fn strip_checksum(line: &str) -> &str {
    match line.rfind('*') {
        Some(idx) if line[idx + 1..].trim().chars().all(|c| c.is_ascii_digit()) => &line[..idx],
        _ => line,
    }
}

/// Uppercases, strips any comment and collapses whitespace. Used to compare
/// host-only tokens such as `@SNAPSHOT`.
pub fn normalize_command(raw: &str) -> String {
    let (body, _) = split_comment(raw);
    body.split_whitespace()
        .map(|part| part.to_ascii_uppercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Formats a coordinate with the fixed precision used for XYZ words.
pub fn fmt_axis(value: f64) -> String {
    format!("{:.3}", value)
}

/// Formats an extrusion length with the fixed precision used for E words.
pub fn fmt_extrusion(value: f64) -> String {
    format!("{:.5}", value)
}

/// Formats a feed rate (mm/min) as an integer word.
pub fn fmt_feedrate(value: f64) -> String {
    format!("{:.0}", value)
}

/// Streams the command lines of a G-code file, skipping blank and
/// comment-only lines.
pub struct AsyncGCodeParser<R: AsyncBufRead + Unpin + Send + 'static> {
    reader: R,
}

impl<R: AsyncBufRead + Unpin + Send + 'static> AsyncGCodeParser<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<String, GCodeError>> + Send {
        let mut reader = self.reader;
        stream! {
            use futures_util::AsyncBufReadExt;
            let mut buf = String::new();
            let mut offset = 0usize;
            loop {
                buf.clear();
                let bytes = match reader.read_line(&mut buf).await {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        yield Err(GCodeError::new(format!("Read error: {}", e), offset..offset));
                        break;
                    }
                };
                if bytes == 0 {
                    break;
                }
                offset += bytes;
                let line = buf.trim();
                if line.is_empty() || line.starts_with(';') {
                    continue;
                }
                yield Ok(line.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_parsing() {
        let src = "G1 X10.0 Y-20.5";
        let mut parser = GCodeParser::new(src, GCodeParserConfig::default());
        let words: Vec<_> = std::iter::from_fn(|| parser.next_command()).collect();
        assert_eq!(words.len(), 3);
        match &words[2] {
            Ok(GCodeCommand::Word { letter, value, .. }) => {
                assert_eq!(*letter, 'Y');
                assert_eq!(*value, "-20.5");
            }
            other => panic!("Expected Y word, got {:?}", other),
        }
    }

    #[test]
    fn test_words_without_spaces() {
        let cmd = ParsedCommand::parse("g1x10y20e0.5").unwrap();
        assert_eq!(cmd.command, "G1");
        assert_eq!(cmd.parameter('X'), Some(10.0));
        assert_eq!(cmd.parameter('Y'), Some(20.0));
        assert_eq!(cmd.parameter('E'), Some(0.5));
    }

    #[test]
    fn test_line_number_and_checksum_are_stripped() {
        let cmd = ParsedCommand::parse("N123 G1 X10 F1500*71").unwrap();
        assert_eq!(cmd.command, "G1");
        assert_eq!(cmd.parameters, vec![('X', Some(10.0)), ('F', Some(1500.0))]);
    }

    #[test]
    fn test_comment_is_kept() {
        let cmd = ParsedCommand::parse("G28 X Y ; home xy").unwrap();
        assert_eq!(cmd.command, "G28");
        assert_eq!(cmd.parameters, vec![('X', None), ('Y', None)]);
        assert_eq!(cmd.comment.as_deref(), Some("home xy"));
        assert_eq!(cmd.to_gcode(), "G28 X Y ;home xy");
    }

    #[test]
    fn test_leading_zero_command_is_canonical() {
        assert_eq!(ParsedCommand::parse("G01 X1").unwrap().command, "G1");
        assert_eq!(ParsedCommand::parse("G29.1").unwrap().command, "G29.1");
    }

    #[test]
    fn test_text_command_keeps_message() {
        let cmd = ParsedCommand::parse("M117 Layer 3 of 40").unwrap();
        assert_eq!(cmd.command, "M117");
        assert!(cmd.parameters.is_empty());
        assert_eq!(cmd.text.as_deref(), Some("Layer 3 of 40"));
    }

    #[test]
    fn test_host_token_is_not_a_command() {
        assert!(ParsedCommand::parse("@SNAPSHOT").is_err());
        assert!(ParsedCommand::parse("; only a comment").is_err());
        assert!(ParsedCommand::parse("G1 Xabc").is_err());
    }

    #[test]
    fn test_normalize_command() {
        assert_eq!(normalize_command("  @snapshot   now ; take it"), "@SNAPSHOT NOW");
        assert_eq!(normalize_command("snap"), "SNAP");
    }

    #[test]
    fn test_fixed_precision_formatting() {
        assert_eq!(fmt_axis(10.0), "10.000");
        assert_eq!(fmt_axis(-0.5), "-0.500");
        assert_eq!(fmt_extrusion(1.0), "1.00000");
        assert_eq!(fmt_feedrate(2400.4), "2400");
    }
}
