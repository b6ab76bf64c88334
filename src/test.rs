use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use crate::connection::{Connection, RequestNameFlags, RequestNameReply, SignalFilter};
use crate::error::ErrorKind;
use crate::message::{Call, Message, MessageKind, MethodResult, ERR_UNKNOWN_OBJECT};
use crate::object::Object;
use crate::value::Value;
use crate::wire::{self, ReadBuffer};

/// The daemon side of a connection, scripted by each test.
struct FakeBus {
    io: DuplexStream,
    buf: ReadBuffer,
    serial: u32,
}

impl FakeBus {
    /// Accept the credential byte and EXTERNAL authentication, answer
    /// `OK`, and await `BEGIN`.
    async fn accept(io: DuplexStream) -> Self {
        let mut bus = FakeBus { io, buf: ReadBuffer::new(), serial: 1000 };

        let auth = bus.read_line().await;
        let mut expected = String::from("\0AUTH EXTERNAL ");
        for digit in unsafe { libc::getuid() }.to_string().bytes() {
            expected.push_str(&format!("{:02x}", digit));
        }
        assert_eq!(auth, expected);

        bus.io
            .write_all(b"OK 0123456789abcdef0123456789abcdef\r\n")
            .await
            .unwrap();
        assert_eq!(bus.read_line().await, "BEGIN");
        bus
    }

    /// Accept plus the Hello exchange and the connection's internal
    /// name-tracking match registrations.
    async fn connect(io: DuplexStream) -> Self {
        let mut bus = Self::accept(io).await;

        let hello = bus.read_message().await;
        assert_eq!(hello.kind, MessageKind::MethodCall);
        assert_eq!(hello.member.as_deref(), Some("Hello"));
        assert_eq!(hello.destination.as_deref(), Some("org.freedesktop.DBus"));
        assert_eq!(hello.serial, 1);
        bus.reply_return(&hello, vec![Value::String(":1.42".into())]).await;

        for _ in 0..3 {
            let add = bus.read_message().await;
            assert_eq!(add.member.as_deref(), Some("AddMatch"));
            // the client never waits for these, but a real bus replies
            bus.reply_return(&add, vec![]).await;
        }
        bus
    }

    async fn read_line(&mut self) -> String {
        loop {
            if let Some(line) = self.buf.read_line().unwrap() {
                return line;
            }
            let mut chunk = [0u8; 1024];
            let n = self.io.read(&mut chunk).await.unwrap();
            assert!(n > 0, "client hung up");
            self.buf.extend(&chunk[..n]);
        }
    }

    async fn read_message(&mut self) -> Message {
        loop {
            if let Some(msg) = self.buf.read_message().unwrap() {
                return msg;
            }
            let mut chunk = [0u8; 1024];
            let n = self.io.read(&mut chunk).await.unwrap();
            assert!(n > 0, "client hung up");
            self.buf.extend(&chunk[..n]);
        }
    }

    async fn send(&mut self, mut msg: Message) -> u32 {
        self.serial += 1;
        msg.serial = self.serial;
        self.io
            .write_all(&wire::encode_message(&msg).unwrap())
            .await
            .unwrap();
        msg.serial
    }

    async fn reply_return(&mut self, to: &Message, body: Vec<Value>) {
        let msg = Message::method_return(to.serial, to.sender.as_deref(), body);
        self.send(msg).await;
    }
}

fn pair() -> (Connection, DuplexStream) {
    let (client_io, server_io) = tokio::io::duplex(65536);
    (Connection::with_transport(client_io), server_io)
}

#[tokio::test]
async fn connect_performs_handshake_and_hello() {
    let (conn, server_io) = pair();

    let (_bus, name) = tokio::join!(FakeBus::connect(server_io), conn.unique_name());
    assert_eq!(name.unwrap(), ":1.42");
}

#[tokio::test]
async fn request_name_becomes_primary_owner() {
    let (conn, server_io) = pair();

    let client = async {
        let flags = RequestNameFlags { do_not_queue: true, ..Default::default() };
        let reply = conn.request_name("com.example.App", flags).await.unwrap();
        assert_eq!(reply, RequestNameReply::PrimaryOwner);
        assert_eq!(conn.owned_names().await.unwrap(), vec!["com.example.App".to_owned()]);
    };
    let bus = async {
        let mut bus = FakeBus::connect(server_io).await;
        let request = bus.read_message().await;
        assert_eq!(request.member.as_deref(), Some("RequestName"));
        assert_eq!(request.body[0].as_str(), Some("com.example.App"));
        assert_eq!(request.body[1].as_u32(), Some(0x4));
        bus.reply_return(&request, vec![Value::Uint32(1)]).await;
        bus
    };
    tokio::join!(client, bus);
}

#[tokio::test]
async fn identical_subscriptions_share_one_match_rule() {
    let (conn, server_io) = pair();
    let filter = SignalFilter::new().interface("com.example.If").member("Sig");

    let client = async {
        let first = conn.subscribe_signals(filter.clone()).await.unwrap();
        let second = conn.subscribe_signals(filter.clone()).await.unwrap();

        // refcount 2 -> 1: the bus hears nothing
        drop(first);
        conn.get_id().await.unwrap();

        // refcount 1 -> 0: RemoveMatch goes out
        drop(second);
    };
    let bus = async {
        let mut bus = FakeBus::connect(server_io).await;

        let add = bus.read_message().await;
        assert_eq!(add.member.as_deref(), Some("AddMatch"));
        assert_eq!(
            add.body[0].as_str(),
            Some("type='signal',interface='com.example.If',member='Sig'")
        );
        bus.reply_return(&add, vec![]).await;

        // the second subscription and the first cancellation are both
        // silent; the next message is the synchronization call
        let get_id = bus.read_message().await;
        assert_eq!(get_id.member.as_deref(), Some("GetId"));
        bus.reply_return(&get_id, vec![Value::String("busid".into())]).await;

        let remove = bus.read_message().await;
        assert_eq!(remove.member.as_deref(), Some("RemoveMatch"));
        assert_eq!(remove.body[0].as_str(), add.body[0].as_str());
    };
    tokio::join!(client, bus);
}

#[tokio::test]
async fn signals_are_filtered_through_the_owner_cache() {
    let (conn, server_io) = pair();

    let client = async {
        let filter = SignalFilter::new()
            .sender("com.example.Svc")
            .interface("com.example.If")
            .member("Sig");
        let mut stream = conn.subscribe_signals(filter).await.unwrap();

        let first = stream.next().await.unwrap();
        assert_eq!(first.values[0].as_u32(), Some(1));
        // marker 2 came from :1.8 and must have been skipped
        let second = stream.next().await.unwrap();
        assert_eq!(second.values[0].as_u32(), Some(3));
        assert_eq!(second.sender.as_deref(), Some(":1.7"));
    };
    let bus = async {
        let mut bus = FakeBus::connect(server_io).await;

        // the well-known sender primes the owner cache in the background
        let lookup = bus.read_message().await;
        assert_eq!(lookup.member.as_deref(), Some("GetNameOwner"));
        assert_eq!(lookup.body[0].as_str(), Some("com.example.Svc"));
        bus.reply_return(&lookup, vec![Value::String(":1.7".into())]).await;

        let add = bus.read_message().await;
        assert_eq!(add.member.as_deref(), Some("AddMatch"));
        bus.reply_return(&add, vec![]).await;

        for (sender, marker) in [(":1.7", 1u32), (":1.8", 2), (":1.7", 3)] {
            let mut sig = Message::signal(
                None,
                "/com/example/obj",
                "com.example.If",
                "Sig",
                vec![Value::Uint32(marker)],
            );
            sig.sender = Some(sender.to_owned());
            bus.send(sig).await;
        }
    };
    tokio::join!(client, bus);
}

struct Echo;

#[async_trait]
impl Object for Echo {
    fn path(&self) -> &str {
        "/o"
    }

    async fn call(&mut self, call: &Call) -> MethodResult<Vec<Value>> {
        assert_eq!(call.interface.as_deref(), Some("com.x"));
        assert_eq!(call.member, "M");
        Ok(call.values.clone())
    }
}

#[tokio::test]
async fn inbound_call_reaches_the_registered_object() {
    let (conn, server_io) = pair();

    let client = async {
        conn.register_object(Box::new(Echo)).await.unwrap();
        conn.unique_name().await.unwrap();
    };
    let bus = async {
        let mut bus = FakeBus::connect(server_io).await;

        let mut call = Message::method_call(Some(":1.42"), "/o", Some("com.x"), "M", vec![Value::Uint32(42)]);
        call.sender = Some(":1.9".to_owned());
        let serial = bus.send(call).await;

        let reply = bus.read_message().await;
        assert_eq!(reply.kind, MessageKind::MethodReturn);
        assert_eq!(reply.reply_serial, Some(serial));
        assert_eq!(reply.destination.as_deref(), Some(":1.9"));
        assert_eq!(reply.body, vec![Value::Uint32(42)]);
    };
    tokio::join!(client, bus);
}

#[tokio::test]
async fn call_to_unregistered_path_is_unknown_object() {
    let (conn, server_io) = pair();

    let client = async {
        conn.unique_name().await.unwrap();
    };
    let bus = async {
        let mut bus = FakeBus::connect(server_io).await;

        let mut call = Message::method_call(Some(":1.42"), "/absent", Some("com.x"), "M", vec![]);
        call.sender = Some(":1.9".to_owned());
        let serial = bus.send(call).await;

        let reply = bus.read_message().await;
        assert_eq!(reply.kind, MessageKind::Error);
        assert_eq!(reply.error_name.as_deref(), Some(ERR_UNKNOWN_OBJECT));
        assert_eq!(reply.reply_serial, Some(serial));
    };
    tokio::join!(client, bus);
}

#[tokio::test]
async fn serials_are_consecutive_and_replies_are_correlated() {
    let (conn, server_io) = pair();

    let client = async {
        let (id, names) = tokio::join!(conn.get_id(), conn.list_names());
        assert_eq!(id.unwrap(), "busid");
        assert_eq!(names.unwrap(), vec!["org.freedesktop.DBus".to_owned()]);
    };
    let bus = async {
        let mut bus = FakeBus::connect(server_io).await;

        // Hello took serial 1 and the three AddMatch calls 2..4
        let get_id = bus.read_message().await;
        assert_eq!(get_id.member.as_deref(), Some("GetId"));
        assert_eq!(get_id.serial, 5);
        let list = bus.read_message().await;
        assert_eq!(list.member.as_deref(), Some("ListNames"));
        assert_eq!(list.serial, 6);

        // answer out of order: each reply must land with its own caller
        bus.reply_return(&list, vec![Value::from(vec!["org.freedesktop.DBus".to_owned()])])
            .await;
        bus.reply_return(&get_id, vec![Value::String("busid".into())]).await;
    };
    tokio::join!(client, bus);
}

#[tokio::test]
async fn remote_errors_surface_with_name_and_values() {
    let (conn, server_io) = pair();

    let client = async {
        let err = conn
            .call_method(Some("com.x"), "/o", Some("com.x.If"), "Boom", vec![])
            .await
            .unwrap_err();
        match err.kind() {
            ErrorKind::MethodError(e) => {
                assert_eq!(e.name, "com.x.Error.Bad");
                assert_eq!(e.message(), Some("nope"));
            }
            other => panic!("unexpected error kind {:?}", other),
        }
    };
    let bus = async {
        let mut bus = FakeBus::connect(server_io).await;
        let call = bus.read_message().await;
        assert_eq!(call.member.as_deref(), Some("Boom"));
        let error = Message::error("com.x.Error.Bad", call.serial, None, vec!["nope".into()]);
        bus.send(error).await;
    };
    tokio::join!(client, bus);
}

#[tokio::test]
async fn pending_calls_fail_when_the_transport_closes() {
    let (conn, server_io) = pair();

    let client = async {
        let err = conn.get_id().await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::ConnectionClosed));
    };
    let bus = async {
        let mut bus = FakeBus::connect(server_io).await;
        let _call = bus.read_message().await;
        // hang up without answering
        drop(bus);
    };
    tokio::join!(client, bus);
}

#[tokio::test]
async fn close_releases_internal_rules_and_fails_later_operations() {
    let (conn, server_io) = pair();

    let client = async {
        conn.unique_name().await.unwrap();
        conn.close().await.unwrap();
        let err = conn.get_id().await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::ConnectionClosed));
    };
    let bus = async {
        let mut bus = FakeBus::connect(server_io).await;
        for _ in 0..3 {
            let remove = bus.read_message().await;
            assert_eq!(remove.member.as_deref(), Some("RemoveMatch"));
        }
    };
    tokio::join!(client, bus);
}

#[tokio::test]
async fn name_events_reach_broadcast_listeners() {
    let (conn, server_io) = pair();

    let client = async {
        let mut acquired = conn.name_acquired();
        let mut lost = conn.name_lost();
        conn.unique_name().await.unwrap();

        assert_eq!(acquired.next().await.unwrap(), "com.example.App");
        assert_eq!(lost.next().await.unwrap(), "com.example.App");
        assert!(conn.owned_names().await.unwrap().is_empty());
    };
    let bus = async {
        let mut bus = FakeBus::connect(server_io).await;
        for member in ["NameAcquired", "NameLost"] {
            let mut sig = Message::signal(
                Some(":1.42"),
                "/org/freedesktop/DBus",
                "org.freedesktop.DBus",
                member,
                vec![Value::String("com.example.App".into())],
            );
            sig.sender = Some("org.freedesktop.DBus".to_owned());
            bus.send(sig).await;
        }
    };
    tokio::join!(client, bus);
}
