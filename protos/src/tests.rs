use bytes::BytesMut;
use prost::Message;

use crate::bmc::v1 as common;

#[test]
fn test_server_roundtrip() {
    let server = common::Server {
        id: "srv-0011223344556677".to_owned(),
        customer_id: "cust-1".to_owned(),
        datacenter_id: "dc-east-1".to_owned(),
        control_endpoints: vec![common::ControlEndpoint {
            endpoint: "192.168.1.100:623".to_owned(),
            r#type: common::EndpointType::Ipmi as i32,
            username: "admin".to_owned(),
            password: "secret".to_owned(),
            ..Default::default()
        }],
        primary_protocol: common::EndpointType::Ipmi as i32,
        status: "configured".to_owned(),
        ..Default::default()
    };

    let mut buf = BytesMut::with_capacity(server.encoded_len());
    server.encode(&mut buf).unwrap();
    let decoded = common::Server::decode(&mut buf).expect("decoded server");
    assert_eq!(server, decoded);
}

#[test]
fn test_console_chunk_handshake() {
    let chunk = common::ConsoleDataChunk {
        session_id: "sess-1".to_owned(),
        server_id: "srv-1".to_owned(),
        data: Default::default(),
        is_handshake: true,
        close_stream: false,
    };

    let mut buf = BytesMut::with_capacity(chunk.encoded_len());
    chunk.encode(&mut buf).unwrap();
    let decoded = common::ConsoleDataChunk::decode(&mut buf).expect("decoded chunk");
    assert!(decoded.is_handshake);
    assert!(!decoded.close_stream);
    assert_eq!(decoded.session_id, "sess-1");
}
