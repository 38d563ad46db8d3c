use std::{net::SocketAddr, sync::Arc, time::Duration};

use lora_gateway_bridge::{
    backend::{BridgeError, MemoryTransport, MqttBackend, MqttConfig, TransportError},
    gateway::{
        packets::{Frame, FrameKind, Payload},
        BackendConfig,
    },
    service::{Service, State},
};
use tokio::{net::UdpSocket, sync::watch, task::JoinHandle, time::timeout};

const WAIT: Duration = Duration::from_secs(3);
const G1: &str = "0102030405060708";
const G2: &str = "aabbccddeeff0011";

struct Harness {
    transport: Arc<MemoryTransport>,
    bridge_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    run: JoinHandle<lora_gateway_bridge::Result<()>>,
}

impl Harness {
    async fn start(gateway_timeout: Duration) -> Self {
        let bridge_addr = {
            let probe = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap()
        };
        let service = Service::new(
            BackendConfig {
                bind: bridge_addr.to_string(),
                gateway_timeout,
                sweep_interval: Duration::from_millis(20),
                ..Default::default()
            },
            MqttConfig::default(),
        );
        let mut state = service.state();

        let (transport, inbound) = MemoryTransport::new();
        let mut connection = Some((transport.clone(), inbound));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let run = tokio::spawn(service.run_with(
            move || {
                let connection = connection.take();
                async move {
                    let (transport, inbound) = connection.ok_or(BridgeError::Transport(TransportError::Closed))?;
                    Ok(MqttBackend::new(transport, inbound))
                }
            },
            shutdown_rx,
        ));

        timeout(WAIT, state.wait_for(|s| *s == State::Running))
            .await
            .unwrap()
            .unwrap();

        Self {
            transport,
            bridge_addr,
            shutdown,
            run,
        }
    }

    async fn stop(self) {
        self.shutdown.send_replace(true);
        timeout(WAIT, self.run).await.unwrap().unwrap().unwrap();
        assert!(self.transport.is_closed());
    }

    fn published_on(&self, topic: &str) -> Vec<serde_json::Value> {
        self.transport
            .published()
            .into_iter()
            .filter(|p| p.topic == topic)
            .map(|p| serde_json::from_slice(&p.payload).unwrap())
            .collect()
    }
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn datagram(token: u16, kind: FrameKind, gateway: &str, body: &str) -> Vec<u8> {
    let mut datagram = vec![0x02];
    datagram.extend_from_slice(&token.to_be_bytes());
    datagram.push(kind as u8);
    datagram.extend_from_slice(&hex::decode(gateway).unwrap());
    datagram.extend_from_slice(body.as_bytes());
    datagram
}

fn push_data(token: u16, gateway: &str) -> Vec<u8> {
    let body = r#"{"rxpk":[{"tmst":3512348611,"chan":2,"rfch":0,"freq":868.100000,"stat":1,"modu":"LORA","datr":"SF7BW125","codr":"4/6","rssi":-35,"lsnr":5.1,"size":5,"data":"AQIDBAU="}]}"#;
    datagram(token, FrameKind::PushData, gateway, body)
}

async fn recv_frame(socket: &UdpSocket) -> Frame {
    let mut buf = [0u8; 4096];
    let (len, _) = timeout(WAIT, socket.recv_from(&mut buf)).await.unwrap().unwrap();
    Frame::decode(&buf[..len]).unwrap()
}

#[tokio::test]
async fn uplink_is_acked_and_published() {
    let harness = Harness::start(Duration::from_secs(60)).await;
    let gateway = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    gateway.send_to(&push_data(0x1234, G1), harness.bridge_addr).await.unwrap();

    let ack = recv_frame(&gateway).await;
    assert_eq!(ack.kind(), FrameKind::PushAck);
    assert_eq!(ack.token, 0x1234);

    let topic = format!("gateway/{G1}/rx");
    eventually("rx publish", || !harness.published_on(&topic).is_empty()).await;
    let rx = &harness.published_on(&topic)[0];
    assert_eq!(rx["rxInfo"]["mac"], G1);
    assert_eq!(rx["rxInfo"]["frequency"], 868_100_000);
    assert_eq!(rx["rxInfo"]["crcStatus"], "valid");
    assert_eq!(rx["rxInfo"]["dataRate"]["spreadFactor"], 7);
    assert_eq!(rx["phyPayload"], "AQIDBAU=");

    assert!(harness.transport.subscriptions().contains(&format!("gateway/{G1}/tx")));
    harness.stop().await;
}

#[tokio::test]
async fn downlink_reaches_gateway_and_ack_is_published() {
    let harness = Harness::start(Duration::from_secs(60)).await;
    let gateway = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let pull = datagram(0x0001, FrameKind::PullData, G1, "");
    gateway.send_to(&pull, harness.bridge_addr).await.unwrap();
    assert_eq!(recv_frame(&gateway).await.kind(), FrameKind::PullAck);

    let tx_topic = format!("gateway/{G1}/tx");
    eventually("subscription", || harness.transport.subscriptions().contains(&tx_topic)).await;

    let command = format!(
        r#"{{"txInfo":{{"mac":"{G1}","immediately":false,"timestamp":3513348611,"frequency":869525000,"power":14,"dataRate":{{"modulation":"LORA","spreadFactor":9,"bandwidth":125}},"codeRate":"4/5"}},"phyPayload":"YAEC"}}"#
    );
    harness.transport.inject(&tx_topic, command).await;

    let resp = recv_frame(&gateway).await;
    let token = resp.token;
    let Payload::PullResp { body } = resp.payload else {
        panic!("expected PULL_RESP, got {:?}", resp.payload);
    };
    assert_eq!(body.txpk.tmst, Some(3_513_348_611));
    assert_eq!(body.txpk.freq, 869.525);
    assert_eq!(body.txpk.data, "YAEC");
    assert_eq!(body.txpk.size, 3);

    let tx_ack = datagram(token, FrameKind::TxAck, G1, r#"{"txpk_ack":{"error":"NONE"}}"#);
    gateway.send_to(&tx_ack, harness.bridge_addr).await.unwrap();

    let ack_topic = format!("gateway/{G1}/ack");
    eventually("ack publish", || !harness.published_on(&ack_topic).is_empty()).await;
    let ack = &harness.published_on(&ack_topic)[0];
    assert_eq!(ack["mac"], G1);
    assert_eq!(ack["token"], token);
    assert_eq!(ack["outcome"], "ok");

    harness.stop().await;
}

#[tokio::test]
async fn downlink_for_unsubscribed_gateway_is_ignored() {
    let harness = Harness::start(Duration::from_secs(60)).await;
    let gateway = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    gateway.send_to(&push_data(1, G1), harness.bridge_addr).await.unwrap();
    recv_frame(&gateway).await;

    // G2 never talked to the bridge, so its tx topic is not subscribed
    let command = format!(
        r#"{{"txInfo":{{"mac":"{G2}","immediately":true,"frequency":869525000,"power":14,"dataRate":{{"modulation":"LORA","spreadFactor":9,"bandwidth":125}},"codeRate":"4/5"}},"phyPayload":"YAEC"}}"#
    );
    harness.transport.inject(&format!("gateway/{G2}/tx"), command).await;

    let mut buf = [0u8; 1024];
    assert!(timeout(Duration::from_millis(200), gateway.recv_from(&mut buf)).await.is_err());
    assert!(!harness.transport.subscriptions().contains(&format!("gateway/{G2}/tx")));
    assert!(harness.published_on(&format!("gateway/{G2}/ack")).is_empty());
    harness.stop().await;
}

#[tokio::test]
async fn presence_follows_gateway_liveness() {
    let harness = Harness::start(Duration::from_millis(300)).await;
    let gateway = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let tx_topic = format!("gateway/{G2}/tx");

    for token in 1..=3u16 {
        gateway.send_to(&push_data(token, G2), harness.bridge_addr).await.unwrap();
        recv_frame(&gateway).await;
    }
    eventually("subscription", || harness.transport.subscriptions().contains(&tx_topic)).await;
    assert_eq!(harness.transport.subscribe_calls(), 1);

    eventually("unsubscription", || harness.transport.subscriptions().is_empty()).await;
    assert_eq!(harness.transport.unsubscribe_calls(), 1);

    // coming back re-subscribes
    gateway.send_to(&push_data(4, G2), harness.bridge_addr).await.unwrap();
    recv_frame(&gateway).await;
    eventually("resubscription", || harness.transport.subscriptions().contains(&tx_topic)).await;
    assert_eq!(harness.transport.subscribe_calls(), 2);

    harness.stop().await;
}

