// End-to-end exercises over real UDP sockets: a raw-bytes client against
// a server bound to a loopback ephemeral port.

use async_io::Async;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::time::Duration;
use tempdir::TempDir;
use tftpd::server::{Server, ServerHandle};
use tokio::task::JoinHandle;
use tokio::time::timeout;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn start_server(root: &TempDir) -> (SocketAddr, ServerHandle, JoinHandle<()>) {
    let server = Server::bind(
        SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
        PathBuf::from(root.path()),
    )
    .unwrap();
    let addr = server.local_addr().unwrap();
    let handle = server.handle();
    let task = tokio::spawn(server.run());
    (addr, handle, task)
}

fn client_socket() -> Async<UdpSocket> {
    Async::<UdpSocket>::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).unwrap()
}

async fn recv_from(sock: &Async<UdpSocket>, buf: &mut [u8]) -> (usize, SocketAddr) {
    timeout(RECV_TIMEOUT, sock.recv_from(buf))
        .await
        .expect("timed out waiting for a server datagram")
        .unwrap()
}

async fn shut_down(handle: ServerHandle, task: JoinHandle<()>) {
    handle.stop();
    task.await.unwrap();
}

#[tokio::test]
async fn test_read_request_round_trip() {
    let root = TempDir::new("tftp-root").unwrap();
    std::fs::write(root.path().join("foo.txt"), b"Hello TFTP World!").unwrap();

    let (server_addr, handle, task) = start_server(&root);
    let client = client_socket();

    client
        .send_to(b"\x00\x01foo.txt\x00octet\x00", server_addr)
        .await
        .unwrap();

    let mut buf = [0_u8; 1024];
    let (len, data_src) = recv_from(&client, &mut buf).await;

    // The data comes back from a fresh ephemeral port, not the listener.
    assert_ne!(data_src.port(), server_addr.port());
    assert_eq!(&buf[..4], b"\x00\x03\x00\x01");
    assert_eq!(&buf[4..len], b"Hello TFTP World!");

    client.send_to(b"\x00\x04\x00\x01", data_src).await.unwrap();

    shut_down(handle, task).await;
}

#[tokio::test]
async fn test_read_request_multi_block() {
    let root = TempDir::new("tftp-root").unwrap();
    // Exactly two full blocks, so the transfer must end with an explicit
    // empty third block.
    let contents = vec![0x5A_u8; 1024];
    std::fs::write(root.path().join("big.bin"), &contents).unwrap();

    let (server_addr, handle, task) = start_server(&root);
    let client = client_socket();

    client
        .send_to(b"\x00\x01big.bin\x00octet\x00", server_addr)
        .await
        .unwrap();

    let mut buf = [0_u8; 1024];
    let mut received = Vec::new();
    let mut session_addr = None;

    for block in 1_u16..=3 {
        let (len, src) = recv_from(&client, &mut buf).await;
        match session_addr {
            None => session_addr = Some(src),
            Some(expected) => assert_eq!(src, expected),
        }
        assert_eq!(&buf[..2], b"\x00\x03");
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), block);
        received.extend_from_slice(&buf[4..len]);

        let mut ack = vec![0x00, 0x04];
        ack.extend_from_slice(&block.to_be_bytes());
        client.send_to(&ack, src).await.unwrap();
    }

    assert_eq!(received, contents);
    shut_down(handle, task).await;
}

#[tokio::test]
async fn test_read_request_missing_file() {
    let root = TempDir::new("tftp-root").unwrap();
    let (server_addr, handle, task) = start_server(&root);
    let client = client_socket();

    client
        .send_to(b"\x00\x01nope.txt\x00octet\x00", server_addr)
        .await
        .unwrap();

    let mut buf = [0_u8; 1024];
    let (len, _) = recv_from(&client, &mut buf).await;
    assert_eq!(&buf[..len], b"\x00\x05\x00\x01File not found\x00");

    shut_down(handle, task).await;
}

#[tokio::test]
async fn test_write_request_round_trip() {
    let root = TempDir::new("tftp-root").unwrap();
    let (server_addr, handle, task) = start_server(&root);
    let client = client_socket();

    client
        .send_to(b"\x00\x02uploaded.txt\x00octet\x00", server_addr)
        .await
        .unwrap();

    let mut buf = [0_u8; 1024];
    let (len, session_addr) = recv_from(&client, &mut buf).await;
    assert_ne!(session_addr.port(), server_addr.port());
    assert_eq!(&buf[..len], b"\x00\x04\x00\x00");

    client
        .send_to(b"\x00\x03\x00\x01Payload", session_addr)
        .await
        .unwrap();
    let (len, src) = recv_from(&client, &mut buf).await;
    assert_eq!(src, session_addr);
    assert_eq!(&buf[..len], b"\x00\x04\x00\x01");

    shut_down(handle, task).await;

    let contents = std::fs::read(root.path().join("uploaded.txt")).unwrap();
    assert_eq!(contents, b"Payload");
}

#[tokio::test]
async fn test_write_request_existing_file_is_refused() {
    let root = TempDir::new("tftp-root").unwrap();
    std::fs::write(root.path().join("taken.txt"), b"mine").unwrap();

    let (server_addr, handle, task) = start_server(&root);
    let client = client_socket();

    client
        .send_to(b"\x00\x02taken.txt\x00octet\x00", server_addr)
        .await
        .unwrap();

    let mut buf = [0_u8; 1024];
    let (len, _) = recv_from(&client, &mut buf).await;
    assert_eq!(&buf[..len], b"\x00\x05\x00\x06File already exists\x00");
    assert_eq!(std::fs::read(root.path().join("taken.txt")).unwrap(), b"mine");

    shut_down(handle, task).await;
}

#[tokio::test]
async fn test_first_packet_must_be_a_request() {
    let root = TempDir::new("tftp-root").unwrap();
    let (server_addr, handle, task) = start_server(&root);
    let client = client_socket();

    // An ack with no session behind it.
    client.send_to(b"\x00\x04\x00\x01", server_addr).await.unwrap();

    let mut buf = [0_u8; 1024];
    let (len, src) = recv_from(&client, &mut buf).await;
    assert_ne!(src.port(), server_addr.port());
    assert_eq!(&buf[..4], b"\x00\x05\x00\x04");
    assert_eq!(buf[len - 1], 0x00);

    shut_down(handle, task).await;
}

#[tokio::test]
async fn test_path_traversal_is_rejected() {
    let root = TempDir::new("tftp-root").unwrap();
    let (server_addr, handle, task) = start_server(&root);
    let client = client_socket();

    client
        .send_to(b"\x00\x01../outside.txt\x00octet\x00", server_addr)
        .await
        .unwrap();

    let mut buf = [0_u8; 1024];
    let (len, _) = recv_from(&client, &mut buf).await;
    assert_eq!(&buf[..4], b"\x00\x05\x00\x02");
    assert_eq!(buf[len - 1], 0x00);

    shut_down(handle, task).await;
}

#[tokio::test]
async fn test_netascii_mode_is_served_verbatim() {
    let root = TempDir::new("tftp-root").unwrap();
    std::fs::write(root.path().join("lines.txt"), b"a\nb\r\nc").unwrap();

    let (server_addr, handle, task) = start_server(&root);
    let client = client_socket();

    client
        .send_to(b"\x00\x01lines.txt\x00NETASCII\x00", server_addr)
        .await
        .unwrap();

    let mut buf = [0_u8; 1024];
    let (len, src) = recv_from(&client, &mut buf).await;
    assert_eq!(&buf[..4], b"\x00\x03\x00\x01");
    assert_eq!(&buf[4..len], b"a\nb\r\nc");
    client.send_to(b"\x00\x04\x00\x01", src).await.unwrap();

    shut_down(handle, task).await;
}

#[tokio::test]
async fn test_duplicate_data_is_reacked_once_written() {
    let root = TempDir::new("tftp-root").unwrap();
    let (server_addr, handle, task) = start_server(&root);
    let client = client_socket();

    client
        .send_to(b"\x00\x02dup.txt\x00octet\x00", server_addr)
        .await
        .unwrap();

    let mut buf = [0_u8; 1024];
    let (_, session_addr) = recv_from(&client, &mut buf).await;

    // First full block.
    let mut block1 = b"\x00\x03\x00\x01".to_vec();
    block1.extend_from_slice(&[0x61_u8; 512]);
    client.send_to(&block1, session_addr).await.unwrap();
    let (len, _) = recv_from(&client, &mut buf).await;
    assert_eq!(&buf[..len], b"\x00\x04\x00\x01");

    // Pretend that ack was lost: retransmit block 1 with different bytes.
    // It must be acked again and must not overwrite what was written.
    let mut dup = b"\x00\x03\x00\x01".to_vec();
    dup.extend_from_slice(&[0x62_u8; 512]);
    client.send_to(&dup, session_addr).await.unwrap();
    let (len, _) = recv_from(&client, &mut buf).await;
    assert_eq!(&buf[..len], b"\x00\x04\x00\x01");

    // Final short block ends the transfer.
    client
        .send_to(b"\x00\x03\x00\x02end", session_addr)
        .await
        .unwrap();
    let (len, _) = recv_from(&client, &mut buf).await;
    assert_eq!(&buf[..len], b"\x00\x04\x00\x02");

    shut_down(handle, task).await;

    let contents = std::fs::read(root.path().join("dup.txt")).unwrap();
    assert_eq!(&contents[..512], &[0x61_u8; 512][..]);
    assert_eq!(&contents[512..], b"end");
}
