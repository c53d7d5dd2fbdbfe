// Streaming command lines out of a G-code file

use futures_util::io::Cursor;
use futures_util::stream::StreamExt;
use lapse_shared::gcode::{AsyncGCodeParser, ParsedCommand};

#[tokio::test]
async fn test_stream_skips_blank_and_comment_lines() {
    let gcode = "; sliced by test\nG28\n\nG1 X10 Y10 E0.5 ; first move\n   \n@SNAPSHOT\n";
    let parser = AsyncGCodeParser::new(Cursor::new(gcode.as_bytes().to_vec()));
    let lines: Vec<_> = parser.into_stream().collect().await;
    let lines: Vec<String> = lines.into_iter().map(|l| l.unwrap()).collect();
    assert_eq!(lines, vec!["G28", "G1 X10 Y10 E0.5 ; first move", "@SNAPSHOT"]);
}

#[tokio::test]
async fn test_streamed_lines_parse() {
    let gcode = "G90\nM83\nG1 X1 Y2 Z0.2 F3000\n";
    let parser = AsyncGCodeParser::new(Cursor::new(gcode.as_bytes().to_vec()));
    let mut stream = Box::pin(parser.into_stream());
    let mut commands = Vec::new();
    while let Some(line) = stream.next().await {
        commands.push(ParsedCommand::parse(&line.unwrap()).unwrap().command);
    }
    assert_eq!(commands, vec!["G90", "M83", "G1"]);
}
