use bytes::Bytes;
use nspmux_codec::{Decoded, Decoder};
use nspmux_transport::Frame;

use crate::cmd::DecodeArgs;
use crate::exit::{protocol_error, CliError, CliResult, DATA_INVALID, SUCCESS};
use crate::output::{print_packet, OutputFormat};

pub fn run(args: DecodeArgs, format: OutputFormat) -> CliResult<i32> {
    let mut decoder = Decoder::new();
    let mut frames = std::iter::once(Frame::Text(args.text)).chain(
        args.attachment
            .into_iter()
            .map(|text| Frame::Binary(Bytes::from(text.into_bytes()))),
    );

    while let Some(frame) = frames.next() {
        match decoder
            .decode(frame)
            .map_err(|err| protocol_error("decode failed", err))?
        {
            Decoded::Packet(packet) => {
                if frames.next().is_some() {
                    return Err(CliError::new(
                        DATA_INVALID,
                        "more attachments given than the packet declares",
                    ));
                }
                print_packet(&packet, format);
                return Ok(SUCCESS);
            }
            Decoded::Pending { .. } => continue,
        }
    }

    decoder
        .finish()
        .map_err(|err| protocol_error("decode failed", err))?;
    Err(CliError::new(DATA_INVALID, "no packet decoded"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(text: &str, attachments: &[&str]) -> DecodeArgs {
        DecodeArgs {
            text: text.to_string(),
            attachment: attachments.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn decodes_plain_event() {
        let code = run(args(r#"2/chat,7["hello",1]"#, &[]), OutputFormat::Json)
            .expect("event should decode");
        assert_eq!(code, SUCCESS);
    }

    #[test]
    fn missing_attachment_is_invalid_data() {
        let err = run(
            args(r#"51-["file",{"_placeholder":true,"num":0}]"#, &[]),
            OutputFormat::Json,
        )
        .expect_err("attachment is missing");
        assert_eq!(err.code, DATA_INVALID);
        assert!(err.message.contains("awaiting 1"), "{}", err.message);
    }

    #[test]
    fn binary_packet_with_attachment_decodes() {
        let code = run(
            args(r#"51-["file",{"_placeholder":true,"num":0}]"#, &["abc"]),
            OutputFormat::Pretty,
        )
        .expect("binary event should decode");
        assert_eq!(code, SUCCESS);
    }

    #[test]
    fn extra_attachment_is_rejected() {
        let err = run(args(r#"2["plain"]"#, &["extra"]), OutputFormat::Json)
            .expect_err("plain packets take no attachments");
        assert_eq!(err.code, DATA_INVALID);
    }

    #[test]
    fn malformed_text_is_invalid_data() {
        let err = run(args("9", &[]), OutputFormat::Json).expect_err("unknown type");
        assert_eq!(err.code, DATA_INVALID);
    }
}
