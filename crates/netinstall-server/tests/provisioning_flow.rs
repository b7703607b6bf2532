//! End-to-end provisioning of one device.
//!
//! Drives the boot responder, block-transfer server and transfer engine
//! through their public handlers the way the listeners do, from the first
//! BOOTP request to the device reporting that it is writing the image.

use async_trait::async_trait;
use bytes::Bytes;
use netinstall_server::packet::{BootpFrame, NetInstallFrame, TftpPacket};
use netinstall_server::{
    BlockTransferServer, BootIdentityTable, BootResponder, CommandLoop, DatagramHandler,
    DatagramSink, EventBus, ImageMetadata, MacAddr, MemoryCatalog, MemoryFileProvider,
    NetInstallError, ServerConfig, ServerEvent, SessionRegistry, TransferEngine, TransferPhase,
};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

const HOST_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 88, 2);
const HOST_MAC: MacAddr = MacAddr::new([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);
const DEVICE_MAC: MacAddr = MacAddr::new([0x64, 0xd1, 0x54, 0x01, 0x02, 0x03]);

/// Keeps every datagram instead of sending it.
#[derive(Default)]
struct CapturingSink {
    sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
}

impl CapturingSink {
    fn take(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    fn take_one(&self) -> (SocketAddr, Vec<u8>) {
        let mut sent = self.take();
        assert_eq!(sent.len(), 1, "expected exactly one datagram");
        sent.remove(0)
    }
}

#[async_trait]
impl DatagramSink for CapturingSink {
    async fn send_to(&self, payload: &[u8], target: SocketAddr) -> netinstall_server::Result<()> {
        self.sent.lock().unwrap().push((target, payload.to_vec()));
        Ok(())
    }
}

fn boot_request(vendor_class: &str) -> Bytes {
    let mut chaddr = [0u8; 16];
    chaddr[..6].copy_from_slice(&DEVICE_MAC.octets());
    let mut vendor = vec![0x63, 0x82, 0x53, 0x63, 60, vendor_class.len() as u8];
    vendor.extend_from_slice(vendor_class.as_bytes());
    vendor.push(0xff);

    BootpFrame {
        op: 1,
        htype: 1,
        hlen: 6,
        hops: 0,
        xid: 0x1234_5678,
        secs: 0,
        flags: 0,
        ciaddr: Ipv4Addr::UNSPECIFIED,
        yiaddr: Ipv4Addr::UNSPECIFIED,
        siaddr: Ipv4Addr::UNSPECIFIED,
        giaddr: Ipv4Addr::UNSPECIFIED,
        chaddr,
        sname: [0; 64],
        file: [0; 128],
        vendor: Bytes::from(vendor),
    }
    .encode()
}

fn device_frame(last: &NetInstallFrame, payload: &'static [u8]) -> Bytes {
    NetInstallFrame {
        source: DEVICE_MAC,
        destination: HOST_MAC,
        remote_counter: last.remote_counter,
        local_counter: last.local_counter.wrapping_add(1),
        payload: Bytes::from_static(payload),
    }
    .encode()
}

fn image_metadata() -> ImageMetadata {
    ImageMetadata {
        filename: "routeros-7.15.3-mmips.npk".to_string(),
        name: "routeros".to_string(),
        version: "7.15.3".to_string(),
        channel: "stable".to_string(),
        arch: "mmips".to_string(),
        description: "RouterOS for mmips".to_string(),
    }
}

#[tokio::test]
async fn test_device_is_booted_and_provisioned() {
    let config = ServerConfig::new(HOST_IP, HOST_MAC);
    let events = EventBus::new();
    let mut log = events.subscribe();
    let sink = Arc::new(CapturingSink::default());
    let identities = Arc::new(BootIdentityTable::new());
    let device: SocketAddr = "192.168.88.20:49152".parse().unwrap();
    let router: SocketAddr = "192.168.88.20:5000".parse().unwrap();

    // Etherboot: BOOTP request and reply
    let boot = BootResponder::new(&config, identities.clone(), sink.clone(), events.clone());
    boot.handle(&boot_request("mmips"), "0.0.0.0:68".parse().unwrap())
        .await
        .unwrap();

    let (target, reply) = sink.take_one();
    assert_eq!(target, "255.255.255.255:68".parse::<SocketAddr>().unwrap());
    assert_eq!(reply.len(), 241);
    let reply = BootpFrame::parse(&reply).unwrap();
    assert_eq!(reply.op, 2);
    assert_eq!(reply.xid, 0x1234_5678);
    assert_eq!(reply.yiaddr, config.client_ip);
    assert_eq!(reply.siaddr, HOST_IP);
    assert_eq!(reply.mac_address(), DEVICE_MAC);

    // Boot file over TFTP, named after the vendor class
    let boot_file: Vec<u8> = (0..1300u32).map(|i| (i % 251) as u8).collect();
    let mut files = MemoryFileProvider::new();
    files.add_file("mmips", boot_file.clone());
    let tftp = BlockTransferServer::new(identities, Arc::new(files), sink.clone(), events.clone());

    let rrq = TftpPacket::ReadRequest {
        filename: "whatever-the-loader-asks-for".to_string(),
        mode: "octet".to_string(),
        options: Vec::new(),
    };
    tftp.handle(&rrq.encode(), device).await.unwrap();

    let mut received = Vec::new();
    loop {
        let (target, data) = sink.take_one();
        assert_eq!(target, device);
        let TftpPacket::Data { block, data } = TftpPacket::parse(&data).unwrap() else {
            panic!("expected a data block");
        };
        received.extend_from_slice(&data);
        tftp.handle(&TftpPacket::Ack { block }.encode(), device)
            .await
            .unwrap();
        if data.len() < 512 {
            break;
        }
    }
    assert_eq!(received, boot_file);
    assert_eq!(tftp.active_transfers().await, 0);
    assert!(sink.take().is_empty());

    // NetInstall: discovery, offer through the operator queue, handshake and chunks
    let sessions = Arc::new(SessionRegistry::new());
    let engine = Arc::new(TransferEngine::new(
        &config,
        sessions,
        sink.clone(),
        events.clone(),
    ));
    let image: Vec<u8> = (0..3000u32).map(|i| (i % 253) as u8).collect();
    let mut catalog = MemoryCatalog::new();
    catalog.add_image(image_metadata(), image.clone());
    let (command_loop, operator) =
        CommandLoop::new(engine.clone(), Arc::new(catalog), std::env::temp_dir());
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(command_loop.run(shutdown_rx));

    let discovery = NetInstallFrame {
        source: DEVICE_MAC,
        destination: MacAddr::new([0; 6]),
        remote_counter: 0,
        local_counter: 0,
        payload: Bytes::from_static(b"DSCV\nkey1\nAAAABBBBCCCC\nhAP lite\nmmips\n"),
    };
    engine.handle(&discovery.encode(), router).await.unwrap();

    let offered = operator
        .start_transfer(DEVICE_MAC, "routeros-7.15.3-mmips.npk")
        .await
        .unwrap();
    assert_eq!(offered.arch, "mmips");

    let (target, offer) = sink.take_one();
    assert_eq!(target, "255.255.255.255:5000".parse::<SocketAddr>().unwrap());
    let mut last = NetInstallFrame::parse(&offer).unwrap();
    assert_eq!(last.destination, DEVICE_MAC);
    assert_eq!(&last.payload[..], b"OFFR\n\n");
    assert_eq!((last.remote_counter, last.local_counter), (1, 0));

    for token in [&b"YACK\n"[..], b"STRT\n"] {
        engine.handle(&device_frame(&last, token), router).await.unwrap();
        last = NetInstallFrame::parse(&sink.take_one().1).unwrap();
        assert!(last.payload.is_empty());
    }

    engine.handle(&device_frame(&last, b"RETR\n"), router).await.unwrap();
    last = NetInstallFrame::parse(&sink.take_one().1).unwrap();
    assert_eq!(&last.payload[..], b"FILE\nrouteros-7.15.3-mmips.npk\n3000\n");

    let mut delivered = Vec::new();
    loop {
        engine.handle(&device_frame(&last, b"RETR\n"), router).await.unwrap();
        last = NetInstallFrame::parse(&sink.take_one().1).unwrap();
        if last.payload.is_empty() {
            break;
        }
        assert!(last.payload.len() <= 1452);
        delivered.extend_from_slice(&last.payload);
    }
    assert_eq!(delivered, image);

    engine.handle(&device_frame(&last, b"WTRM\n"), router).await.unwrap();
    assert!(sink.take().is_empty(), "termination is not answered");

    let sessions = operator.list_sessions().await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].phase, TransferPhase::Done);
    // OFFR, YACK, STRT, FILE, three chunks and the empty end marker
    assert_eq!((sessions[0].remote_counter, sessions[0].local_counter), (8, 8));

    let mut seen = Vec::new();
    while let Ok(event) = log.try_recv() {
        seen.push(event);
    }
    assert!(seen.contains(&ServerEvent::BootReplySent {
        mac: DEVICE_MAC,
        assigned: config.client_ip,
    }));
    assert!(seen.contains(&ServerEvent::BlockTransferCompleted {
        client: device,
        filename: "mmips".to_string(),
    }));
    assert!(seen.contains(&ServerEvent::ChunkProgress {
        mac: DEVICE_MAC,
        sent: 3000,
        total: 3000,
        percent: 100,
    }));
    assert_eq!(
        seen.last(),
        Some(&ServerEvent::TransferTerminated { mac: DEVICE_MAC })
    );
}

#[tokio::test]
async fn test_replayed_frame_changes_nothing() {
    let config = ServerConfig::new(HOST_IP, HOST_MAC);
    let sink = Arc::new(CapturingSink::default());
    let engine = TransferEngine::new(
        &config,
        Arc::new(SessionRegistry::new()),
        sink.clone(),
        EventBus::new(),
    );
    let router: SocketAddr = "192.168.88.20:5000".parse().unwrap();

    let discovery = NetInstallFrame {
        source: DEVICE_MAC,
        destination: MacAddr::new([0xff; 6]),
        remote_counter: 0,
        local_counter: 0,
        payload: Bytes::from_static(b"DSCV\nkey1\nAAAA\nhAP lite\nmmips\n"),
    };
    engine.handle(&discovery.encode(), router).await.unwrap();
    engine
        .start(&DEVICE_MAC, "routeros.npk", Bytes::from_static(b"npk"))
        .await
        .unwrap();
    let offer = NetInstallFrame::parse(&sink.take_one().1).unwrap();

    let yack = device_frame(&offer, b"YACK\n");
    engine.handle(&yack, router).await.unwrap();
    assert_eq!(sink.take().len(), 1);

    let err = engine.handle(&yack, router).await.unwrap_err();
    assert!(matches!(err, NetInstallError::ProtocolViolation(_)));
    assert!(sink.take().is_empty());

    let session = engine.sessions().get(&DEVICE_MAC).await.unwrap();
    let session = session.lock().await;
    assert_eq!(session.phase(), TransferPhase::Acked);
    assert_eq!((session.remote_counter, session.local_counter), (2, 2));
}
