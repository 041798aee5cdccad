//! End-to-end `Client`/`Server` scenarios over real loopback sockets.

use std::net::{Ipv4Addr, SocketAddr};

use reliant::segment::{self, SegmentType};
use reliant::{Client, Server};
use tokio::net::UdpSocket;

#[tokio::test]
async fn handshake_then_message_round_trip_both_directions() {
    let server = Server::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let server_addr = server.local_addr().unwrap();

    let client = Client::connect(server_addr, (Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let accepted = server.accept().await.unwrap();

    client.send_msg(b"hello from client").await.unwrap();
    assert_eq!(accepted.recv_msg().await.unwrap(), b"hello from client");

    accepted.send_msg(b"hello from server").await.unwrap();
    assert_eq!(client.recv_msg().await.unwrap(), b"hello from server");
}

/// S6: once a message completes on a given `transID`, the next message that
/// reuses that same slot gets a fresh `MsgRecv`. The first message is not
/// redelivered alongside it.
#[tokio::test]
async fn reused_transaction_slot_does_not_redeliver_the_prior_message() {
    let server = Server::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let server_addr = server.local_addr().unwrap();

    let client = Client::connect(server_addr, (Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let accepted = server.accept().await.unwrap();

    client.send_msg(&vec![0xAAu8; 100]).await.unwrap();
    let first = accepted.recv_msg().await.unwrap();
    assert_eq!(first, vec![0xAAu8; 100]);

    // The slot freed by the first send_msg is reused for the second.
    client.send_msg(&vec![0xBBu8; 50]).await.unwrap();
    let second = accepted.recv_msg().await.unwrap();
    assert_eq!(second, vec![0xBBu8; 50]);
}

#[tokio::test]
async fn ping_reports_a_round_trip_time() {
    let server = Server::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let server_addr = server.local_addr().unwrap();

    let client = Client::connect(server_addr, (Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let _accepted = server.accept().await.unwrap();

    let rtt = client.ping().await.unwrap();
    assert!(rtt.as_secs() < 1);
}

/// S3-style loss recovery: a one-shot UDP relay sits between client and
/// server and drops one `Trans` segment's first transmission. The message
/// still arrives complete once `queryReceive` drives the retransmission.
#[tokio::test]
async fn message_survives_a_single_dropped_segment() {
    let server = Server::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let server_addr = server.local_addr().unwrap();

    let client_side = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let server_side = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let relay_addr = client_side.local_addr().unwrap();

    tokio::spawn(run_lossy_relay(client_side, server_side, server_addr, 3));

    let client = Client::connect(relay_addr, (Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let accepted = server.accept().await.unwrap();

    let payload = vec![0xCDu8; 10_000]; // 8 segments at BODY_MAX=1400
    let expected = payload.clone();
    let send = tokio::spawn(async move { client.send_msg(&payload).await });

    let got = accepted.recv_msg().await.unwrap();
    send.await.unwrap().unwrap();

    assert_eq!(got, expected);
}

/// Forwards datagrams between a client and `server_addr`, dropping the first
/// `Trans` segment seen with `order_id == drop_order_id` and letting every
/// later transmission of it through.
async fn run_lossy_relay(client_side: UdpSocket, server_side: UdpSocket, server_addr: SocketAddr, drop_order_id: u16) {
    let mut client_peer: Option<SocketAddr> = None;
    let mut dropped_once = false;
    let mut from_client = vec![0u8; 2048];
    let mut from_server = vec![0u8; 2048];

    loop {
        tokio::select! {
            res = client_side.recv_from(&mut from_client) => {
                let Ok((n, from)) = res else { return };
                client_peer = Some(from);
                let data = &from_client[..n];

                if !dropped_once {
                    if let Ok(seg) = segment::decode(data) {
                        if seg.ty == SegmentType::Trans && seg.order_id == drop_order_id {
                            dropped_once = true;
                            continue;
                        }
                    }
                }

                let _ = server_side.send_to(data, server_addr).await;
            }
            res = server_side.recv_from(&mut from_server) => {
                let Ok((n, _)) = res else { return };
                if let Some(peer) = client_peer {
                    let _ = client_side.send_to(&from_server[..n], peer).await;
                }
            }
        }
    }
}
