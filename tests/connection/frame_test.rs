//! Wire format of framed messages.

use ioworker::connection::frame::{encode_header, parse_header};
use ioworker::connection::{ConnectionError, Frame, FrameReader, FrameWriter, HEADER_LEN, MAX_PAYLOAD};
use ioworker::protocol::{CommandCode, HostArgs, Locator, Reply, Request, ResultCode};

fn wire_text(frame: &Frame) -> String {
    format!("{:?}", String::from_utf8_lossy(&frame.to_bytes().unwrap()))
}

fn request_frame(request: &Request) -> Frame {
    Frame::new(request.code().as_u8(), request.encode().unwrap())
}

#[test]
fn test_signal_frame_on_the_wire() {
    let frame = Frame::empty(ResultCode::Finished.as_u8());
    insta::assert_snapshot!(wire_text(&frame), @r#""     0_68_""#);
}

#[test]
fn test_get_frame_on_the_wire() {
    let locator: Locator = "file:///etc/hosts".parse().unwrap();
    let frame = request_frame(&Request::Get(locator));
    assert_eq!(frame.code, CommandCode::Get.as_u8());
    let text = String::from_utf8(frame.to_bytes().unwrap()).unwrap();
    assert_eq!(&text[6..10], "_43_");
    let len = usize::from_str_radix(text[..6].trim_start(), 16).unwrap();
    assert_eq!(len, text.len() - HEADER_LEN);
}

#[test]
fn test_host_frame_on_the_wire() {
    let host = HostArgs {
        host: "example.org".to_string(),
        port: 21,
        user: Some("alice".to_string()),
        pass: None,
    };
    let frame = request_frame(&Request::Host(host));
    let text = String::from_utf8(frame.to_bytes().unwrap()).unwrap();
    assert!(text.starts_with(&encode_header(frame.payload.len(), 0x30).unwrap()));
    assert!(text.contains("example.org"));
}

#[test]
fn test_header_limits() {
    assert_eq!(encode_header(MAX_PAYLOAD, 0xff).unwrap(), "ffffff_ff_");
    assert!(matches!(
        encode_header(MAX_PAYLOAD + 1, 0x64),
        Err(ConnectionError::PayloadTooLarge(n)) if n == MAX_PAYLOAD + 1
    ));
    assert_eq!(parse_header(b"ffffff_ff_").unwrap(), (MAX_PAYLOAD, 0xff));
    assert_eq!(parse_header(b"     a_ 9_").unwrap(), (10, 9));
    assert!(matches!(parse_header(b"     a-42_"), Err(ConnectionError::BadHeader(_))));
    assert!(matches!(parse_header(b"    zz_42_"), Err(ConnectionError::BadHeader(_))));
    assert!(matches!(parse_header(b"+00010_42_"), Err(ConnectionError::BadHeader(_))));
}

#[tokio::test]
async fn test_frames_survive_a_byte_stream_in_order() {
    let frames = vec![
        request_frame(&Request::Stat("file:///tmp".parse().unwrap())),
        Frame::empty(ResultCode::DataReq.as_u8()),
        Frame::new(ResultCode::Data.as_u8(), vec![0u8; 70_000]),
        Frame::new(ResultCode::Data.as_u8(), Vec::new()),
        Frame::empty(ResultCode::Finished.as_u8()),
    ];

    let (client, server) = tokio::io::duplex(4096);
    let sent = frames.clone();
    let writer = tokio::spawn(async move {
        let mut writer = FrameWriter::new(client);
        for frame in &sent {
            writer.write_frame(frame).await.unwrap();
        }
        writer.shutdown().await.unwrap();
    });

    let mut reader = FrameReader::new(server);
    let mut received = Vec::new();
    while let Some(frame) = reader.read_frame().await.unwrap() {
        received.push(frame);
    }
    writer.await.unwrap();

    assert_eq!(received, frames);
    assert!(reader.buffer_len() >= 70_000);
}

#[tokio::test]
async fn test_replies_decode_from_frames() {
    let bytes = [
        Frame::new(ResultCode::Data.as_u8(), b"abc".to_vec()).to_bytes().unwrap(),
        Frame::empty(ResultCode::Finished.as_u8()).to_bytes().unwrap(),
    ]
    .concat();

    let mut reader = FrameReader::new(bytes.as_slice());
    let first = reader.read_frame().await.unwrap().unwrap();
    let second = reader.read_frame().await.unwrap().unwrap();
    assert!(reader.read_frame().await.unwrap().is_none());

    assert_eq!(Reply::decode(first.code, &first.payload).unwrap(), Reply::Data(b"abc".to_vec()));
    assert_eq!(Reply::decode(second.code, &second.payload).unwrap(), Reply::Finished);
}
