//! End-to-end ATT/GATT tests over an in-memory transport pair.
//!
//! One side runs a real server with an attribute table, the other a client;
//! both bearers run concurrently on the test executor. A few tests script
//! the peer by driving the raw transport endpoint instead.
use core::cell::RefCell;
use std::time::Duration;

use embassy_futures::join::{join, join4};
use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use gatt_host::att::{AttErrorCode, AttReq};
use gatt_host::mock_transport::TransportBus;
use gatt_host::prelude::*;

type Mutex = CriticalSectionRawMutex;
const MTU: usize = 128;
const TABLE_SIZE: usize = 64;

const BATTERY_LEVEL: u16 = 0x2a19;
const DEVICE_NAME: &[u8] = b"Hello";

struct Store {
    value: RefCell<Vec<u8>>,
}

impl Store {
    fn new() -> Self {
        Self {
            value: RefCell::new(Vec::new()),
        }
    }

    fn set(&self, value: &[u8]) {
        let mut v = self.value.borrow_mut();
        v.clear();
        v.extend_from_slice(value);
    }
}

impl GattHandler for &Store {
    async fn read(&mut self, attr: &GattAttrDesc<'_>, offset: usize, data: &mut [u8]) -> Result<usize, AttErrorCode> {
        let value = self.value.borrow();
        let src: &[u8] = if *attr.uuid == Uuid::new_short(0x2a00) {
            DEVICE_NAME
        } else {
            &value
        };
        if offset > src.len() {
            return Err(AttErrorCode::InvalidOffset);
        }
        let len = data.len().min(src.len() - offset);
        data[..len].copy_from_slice(&src[offset..offset + len]);
        Ok(len)
    }

    async fn write(&mut self, attr: &GattAttrDesc<'_>, offset: usize, data: &[u8]) -> Result<(), AttErrorCode> {
        let _ = attr;
        let mut value = self.value.borrow_mut();
        if offset > value.len() {
            return Err(AttErrorCode::InvalidOffset);
        }
        value.truncate(offset);
        value.extend_from_slice(data);
        Ok(())
    }
}

struct Handles {
    battery: ServiceHandle,
    extra: ServiceHandle,
    battery_level: Characteristic,
}

/// GAP + GATT (with Service Changed) + a secondary service + battery, plus
/// one extra service to flip active later.
fn build_table(table: &mut AttributeTable<Mutex, TABLE_SIZE>) -> Handles {
    let mut svc = table.add_service(Service::new(0x1800u16));
    svc.add_characteristic_ro(0x2a00u16);
    svc.build();

    let mut svc = table.add_service(Service::new(0x1801u16));
    svc.add_characteristic(0x2a05u16, &[CharacteristicProp::Indicate], &[]);
    svc.build();

    let aux = table.add_service(Service::secondary(0x180au16)).build();

    let mut svc = table.add_service(Service::new(0x180fu16));
    svc.add_included_service(&aux);
    let mut chr = svc.add_characteristic(
        BATTERY_LEVEL,
        &[
            CharacteristicProp::Read,
            CharacteristicProp::Write,
            CharacteristicProp::Notify,
            CharacteristicProp::Indicate,
        ],
        &[AttributePerm::Read, AttributePerm::Write],
    );
    chr.add_descriptor_ro(0x2901u16);
    let battery_level = chr.build();
    let battery = svc.build();

    let mut svc = table.add_service(Service::new(0x1815u16));
    svc.add_characteristic_ro(0x2a56u16);
    let extra = svc.build();

    Handles {
        battery,
        extra,
        battery_level,
    }
}

async fn deadline<F: core::future::Future>(fut: F) -> F::Output {
    match tokio::time::timeout(Duration::from_secs(10), fut).await {
        Ok(out) => out,
        Err(_) => panic!("test deadline exceeded"),
    }
}

/// Declare a cross-linked bearer pair with the default MTU of 23.
macro_rules! bearer_pair {
    ($client_bearer:ident, $server_bearer:ident) => {
        let _ = env_logger::builder().is_test(true).try_init();
        let bus: TransportBus<Mutex, MTU> = TransportBus::new();
        let (ta, tb) = bus.split();
        let $client_bearer = AttBearer::<_, Mutex, MTU>::new(ta);
        let $server_bearer = AttBearer::<_, Mutex, MTU>::new(tb);
        $client_bearer.set_preferred_mtu(23);
        $server_bearer.set_preferred_mtu(23);
    };
}

/// Run a scenario against live infrastructure (both bearers, server loop,
/// client task), failing if the infrastructure stops first.
macro_rules! run_scenario {
    ($client_bearer:ident, $server_bearer:ident, $server:ident, $client:ident, $store:ident, $scenario:expr) => {{
        let infra = join4(
            $client_bearer.run(),
            $server_bearer.run(),
            $server.process(&$store),
            $client.task(),
        );
        deadline(async {
            match select(infra, $scenario).await {
                Either::First(_) => panic!("infrastructure stopped"),
                Either::Second(out) => out,
            }
        })
        .await
    }};
}

#[tokio::test(flavor = "current_thread")]
async fn mtu_exchange_wire_format() {
    let _ = env_logger::builder().is_test(true).try_init();
    let bus: TransportBus<Mutex, MTU> = TransportBus::new();
    let (ta, tb) = bus.split();
    let bearer = AttBearer::<_, Mutex, MTU>::new(ta);
    bearer.set_preferred_mtu(23);

    deadline(async {
        let script = async {
            let mut buf = [0u8; MTU];
            let n = tb.recv(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], &[0x02, 0x17, 0x00]);
            // Server proposes 100; effective is min(23, 100).
            tb.send(&[0x03, 0x64, 0x00]).await.unwrap();
        };
        match select(bearer.run(), join(script, bearer.exchange_mtu())).await {
            Either::First(_) => panic!("bearer stopped"),
            Either::Second((_, negotiated)) => {
                assert_eq!(negotiated.unwrap(), 23);
            }
        }
        assert_eq!(bearer.mtu(), 23);
    })
    .await;
}

#[tokio::test(flavor = "current_thread")]
async fn discovery_of_empty_database() {
    let table: AttributeTable<Mutex, TABLE_SIZE> = AttributeTable::new();
    let store = Store::new();
    bearer_pair!(client_bearer, server_bearer);
    let server = GattServer::<_, Mutex, TABLE_SIZE, MTU>::new(&server_bearer, &table);
    let client = GattClient::<_, Mutex, MTU>::new(&client_bearer);

    run_scenario!(client_bearer, server_bearer, server, client, store, async {
        client.discover().await.unwrap();
        assert!(client.is_ready());
        assert!(client.services().is_empty());
    });
}

#[tokio::test(flavor = "current_thread")]
async fn discovery_mirrors_database() {
    let mut table: AttributeTable<Mutex, TABLE_SIZE> = AttributeTable::new();
    let handles = build_table(&mut table);
    let store = Store::new();
    bearer_pair!(client_bearer, server_bearer);
    let server = GattServer::<_, Mutex, TABLE_SIZE, MTU>::new(&server_bearer, &table);
    let client = GattClient::<_, Mutex, MTU>::new(&client_bearer);

    run_scenario!(client_bearer, server_bearer, server, client, store, async {
        client.discover().await.unwrap();
        assert!(client.is_ready());

        let services = client.services();
        let uuids: Vec<_> = services.iter().map(|s| s.uuid().clone()).collect();
        for uuid in [0x1800u16, 0x1801, 0x180a, 0x180f, 0x1815] {
            assert!(uuids.contains(&Uuid::new_short(uuid)), "missing {:04x}", uuid);
        }
        // Handle order.
        for pair in services.windows(2) {
            assert!(pair[0].start() < pair[1].start());
        }

        let battery = services
            .iter()
            .find(|s| *s.uuid() == Uuid::new_short(0x180f))
            .unwrap();
        assert!(battery.primary());
        assert_eq!(battery.start(), handles.battery.start());
        assert_eq!(battery.end(), handles.battery.end());
        let aux = services
            .iter()
            .find(|s| *s.uuid() == Uuid::new_short(0x180a))
            .unwrap();
        assert!(!aux.primary());

        let chars = client.characteristics(battery);
        assert_eq!(chars.len(), 1);
        let level = &chars[0];
        assert_eq!(*level.uuid(), Uuid::new_short(BATTERY_LEVEL));
        assert_eq!(level.handle(), handles.battery_level.handle());
        assert_eq!(
            level.characteristic().cccd_handle(),
            handles.battery_level.cccd_handle()
        );

        let descriptors = client.descriptors(level);
        let uuids: Vec<_> = descriptors.iter().map(|d| d.uuid().clone()).collect();
        assert!(uuids.contains(&Uuid::new_short(0x2902)));
        assert!(uuids.contains(&Uuid::new_short(0x2901)));

        let includes = client.includes(battery);
        assert_eq!(includes.len(), 1);
        assert_eq!(*includes[0].uuid(), Uuid::new_short(0x180a));
        assert_eq!(includes[0].start(), aux.start());

        // Initial discovery announces every service, in handle order.
        for svc in services.iter() {
            match client.next_event().await {
                ServiceEvent::Added(added) => assert_eq!(&added, svc),
                e => panic!("unexpected event {:?}", e),
            }
        }
    });
}

#[tokio::test(flavor = "current_thread")]
async fn read_write_roundtrip() {
    let mut table: AttributeTable<Mutex, TABLE_SIZE> = AttributeTable::new();
    let handles = build_table(&mut table);
    let store = Store::new();
    store.set(&[0x64]);
    bearer_pair!(client_bearer, server_bearer);
    let server = GattServer::<_, Mutex, TABLE_SIZE, MTU>::new(&server_bearer, &table);
    let client = GattClient::<_, Mutex, MTU>::new(&client_bearer);

    run_scenario!(client_bearer, server_bearer, server, client, store, async {
        let mut buf = [0u8; 64];
        let n = client
            .read_characteristic(&handles.battery_level, &mut buf)
            .await
            .unwrap();
        assert_eq!(&buf[..n], &[0x64]);

        client
            .write_characteristic(&handles.battery_level, &[0x32])
            .await
            .unwrap();
        assert_eq!(&store.value.borrow()[..], &[0x32]);

        client
            .write_without_response(&handles.battery_level, &[0x10])
            .await
            .unwrap();
        // The command is ordered before the following read on the same bearer.
        let n = client
            .read_characteristic(&handles.battery_level, &mut buf)
            .await
            .unwrap();
        assert_eq!(&buf[..n], &[0x10]);
    });
}

#[tokio::test(flavor = "current_thread")]
async fn read_device_name() {
    let mut table: AttributeTable<Mutex, TABLE_SIZE> = AttributeTable::new();
    build_table(&mut table);
    let store = Store::new();
    bearer_pair!(client_bearer, server_bearer);
    let server = GattServer::<_, Mutex, TABLE_SIZE, MTU>::new(&server_bearer, &table);
    let client = GattClient::<_, Mutex, MTU>::new(&client_bearer);

    run_scenario!(client_bearer, server_bearer, server, client, store, async {
        // The GAP device name value sits at handle 0x0003.
        let chr = Characteristic::from_raw(0x0003, None);
        let mut buf = [0u8; 32];
        let n = client.read_characteristic(&chr, &mut buf).await.unwrap();
        assert_eq!(&buf[..n], DEVICE_NAME);
    });
}

#[tokio::test(flavor = "current_thread")]
async fn read_long_reassembles_value() {
    let mut table: AttributeTable<Mutex, TABLE_SIZE> = AttributeTable::new();
    let handles = build_table(&mut table);
    let store = Store::new();
    let value: Vec<u8> = (0u8..30).collect();
    store.set(&value);
    bearer_pair!(client_bearer, server_bearer);
    let server = GattServer::<_, Mutex, TABLE_SIZE, MTU>::new(&server_bearer, &table);
    let client = GattClient::<_, Mutex, MTU>::new(&client_bearer);

    run_scenario!(client_bearer, server_bearer, server, client, store, async {
        // A single read caps at MTU-1 bytes.
        let mut buf = [0u8; 64];
        let n = client
            .read_characteristic(&handles.battery_level, &mut buf)
            .await
            .unwrap();
        assert_eq!(n, 22);

        // Read long reassembles the full value.
        let n = client
            .read_long_characteristic(&handles.battery_level, &mut buf)
            .await
            .unwrap();
        assert_eq!(&buf[..n], &value[..]);
    });
}

#[tokio::test(flavor = "current_thread")]
async fn reliable_write_long_applies_value() {
    let mut table: AttributeTable<Mutex, TABLE_SIZE> = AttributeTable::new();
    let handles = build_table(&mut table);
    let store = Store::new();
    let value: Vec<u8> = (0u8..60).collect();
    bearer_pair!(client_bearer, server_bearer);
    let server = GattServer::<_, Mutex, TABLE_SIZE, MTU>::new(&server_bearer, &table);
    let client = GattClient::<_, Mutex, MTU>::new(&client_bearer);

    run_scenario!(client_bearer, server_bearer, server, client, store, async {
        // Longer than MTU-3, so this takes the reliable long write path.
        client
            .write_characteristic(&handles.battery_level, &value)
            .await
            .unwrap();
        assert_eq!(&store.value.borrow()[..], &value[..]);
    });
}

#[tokio::test(flavor = "current_thread")]
async fn reliable_write_mismatch_discards_queue() {
    let _ = env_logger::builder().is_test(true).try_init();
    let bus: TransportBus<Mutex, MTU> = TransportBus::new();
    let (ta, tb) = bus.split();
    let bearer = AttBearer::<_, Mutex, MTU>::new(ta);

    let value: Vec<u8> = (0u8..20).collect();

    deadline(async {
        let script = async {
            let mut buf = [0u8; MTU];
            // First chunk (18 bytes at offset 0) echoed verbatim.
            let n = tb.recv(&mut buf).await.unwrap();
            assert_eq!(buf[0], 0x16);
            let mut echo = buf[..n].to_vec();
            echo[0] = 0x17;
            tb.send(&echo).await.unwrap();
            // Second chunk: corrupt the echoed value.
            let n = tb.recv(&mut buf).await.unwrap();
            assert_eq!(buf[0], 0x16);
            let mut echo = buf[..n].to_vec();
            echo[0] = 0x17;
            *echo.last_mut().unwrap() ^= 0xff;
            tb.send(&echo).await.unwrap();
            // The client gives up with Execute Write (cancel).
            let n = tb.recv(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], &[0x18, 0x00]);
            tb.send(&[0x19]).await.unwrap();
        };
        let chr = Characteristic::from_raw(0x0010, None);
        let client = GattClient::<_, Mutex, MTU>::new(&bearer);
        let write = client.write_long_characteristic(&chr, &value, true);
        match select(bearer.run(), join(script, write)).await {
            Either::First(_) => panic!("bearer stopped"),
            Either::Second((_, result)) => {
                assert_eq!(result, Err(BleHostError::BleHost(Error::ReliableWriteMismatch)));
            }
        }
    })
    .await;
}

#[tokio::test(flavor = "current_thread")]
async fn subscribe_and_notify() {
    let mut table: AttributeTable<Mutex, TABLE_SIZE> = AttributeTable::new();
    let handles = build_table(&mut table);
    let store = Store::new();
    bearer_pair!(client_bearer, server_bearer);
    let server = GattServer::<_, Mutex, TABLE_SIZE, MTU>::new(&server_bearer, &table);
    let client = GattClient::<_, Mutex, MTU>::new(&client_bearer);

    run_scenario!(client_bearer, server_bearer, server, client, store, async {
        let mut listener = client.subscribe(&handles.battery_level, false).await.unwrap();

        server.notify(handles.battery_level, &[0x55]).await.unwrap();

        let n = listener.next().await;
        assert_eq!(n.handle(), handles.battery_level.handle());
        assert_eq!(n.as_ref(), &[0x55]);
        assert!(!n.indicated());

        client.unsubscribe(&handles.battery_level).await.unwrap();
    });
}

#[tokio::test(flavor = "current_thread")]
async fn indication_waits_for_confirmation() {
    let mut table: AttributeTable<Mutex, TABLE_SIZE> = AttributeTable::new();
    let handles = build_table(&mut table);
    let store = Store::new();
    bearer_pair!(client_bearer, server_bearer);
    let server = GattServer::<_, Mutex, TABLE_SIZE, MTU>::new(&server_bearer, &table);
    let client = GattClient::<_, Mutex, MTU>::new(&client_bearer);

    run_scenario!(client_bearer, server_bearer, server, client, store, async {
        // Indicating without a subscription is refused.
        assert!(server.indicate(handles.battery_level, &[0x01]).await.is_err());

        let mut listener = client.subscribe(&handles.battery_level, true).await.unwrap();

        // The indication resolves only once the subscriber returned the
        // value and the client confirmed.
        let (ind, n) = join(server.indicate(handles.battery_level, &[0x99]), async {
            let n = listener.next().await;
            drop(listener);
            n
        })
        .await;
        ind.unwrap();
        assert_eq!(n.as_ref(), &[0x99]);
        assert!(n.indicated());
    });
}

#[tokio::test(flavor = "current_thread")]
async fn indication_confirmation_awaits_subscriber() {
    let mut table: AttributeTable<Mutex, TABLE_SIZE> = AttributeTable::new();
    let handles = build_table(&mut table);
    let store = Store::new();
    bearer_pair!(client_bearer, server_bearer);
    let server = GattServer::<_, Mutex, TABLE_SIZE, MTU>::new(&server_bearer, &table);
    let client = GattClient::<_, Mutex, MTU>::new(&client_bearer);

    run_scenario!(client_bearer, server_bearer, server, client, store, async {
        let listener = client.subscribe(&handles.battery_level, true).await.unwrap();

        // While the subscriber has not returned the value, the confirmation
        // is held back and the indication stays pending.
        let indicate = server.indicate(handles.battery_level, &[0x42]);
        match select(indicate, tokio::time::sleep(Duration::from_millis(200))).await {
            Either::First(_) => panic!("confirmed before the subscriber returned"),
            Either::Second(()) => {}
        }

        // Dropping the listener releases the held value; a fresh round then
        // completes as soon as its subscriber returns it.
        drop(listener);
        let mut listener = client.subscribe(&handles.battery_level, true).await.unwrap();
        let (ind, n) = join(server.indicate(handles.battery_level, &[0x43]), async {
            let n = listener.next().await;
            drop(listener);
            n
        })
        .await;
        ind.unwrap();
        assert_eq!(n.as_ref(), &[0x43]);
    });
}

#[tokio::test(flavor = "current_thread")]
async fn cancel_resolves_pending_requests() {
    let _ = env_logger::builder().is_test(true).try_init();
    let bus: TransportBus<Mutex, MTU> = TransportBus::new();
    let (ta, tb) = bus.split();
    let bearer = AttBearer::<_, Mutex, MTU>::new(ta);
    let client = GattClient::<_, Mutex, MTU>::new(&bearer);

    deadline(async {
        let chr = Characteristic::from_raw(0x0005, None);
        let mut buf = [0u8; 16];
        let op = client.read_characteristic(&chr, &mut buf);
        let script = async {
            // Swallow the request and cancel the client instead of answering.
            let mut rx = [0u8; MTU];
            let _ = tb.recv(&mut rx).await.unwrap();
            client.cancel();
        };
        match select(bearer.run(), join(script, op)).await {
            Either::First(_) => panic!("bearer stopped"),
            Either::Second((_, r)) => {
                assert_eq!(r.unwrap_err(), BleHostError::BleHost(Error::Cancelled));
            }
        }

        // The bearer survives; only the client is unusable.
        assert!(bearer.is_connected());
        let mut buf = [0u8; 16];
        let r = client.read_characteristic(&chr, &mut buf).await;
        assert_eq!(r.unwrap_err(), BleHostError::BleHost(Error::Cancelled));
    })
    .await;
}

#[tokio::test(flavor = "current_thread")]
async fn service_changed_triggers_rediscovery() {
    let mut table: AttributeTable<Mutex, TABLE_SIZE> = AttributeTable::new();
    let handles = build_table(&mut table);
    let store = Store::new();
    bearer_pair!(client_bearer, server_bearer);
    let server = GattServer::<_, Mutex, TABLE_SIZE, MTU>::new(&server_bearer, &table);
    let client = GattClient::<_, Mutex, MTU>::new(&client_bearer);

    // Hidden until after the client has discovered.
    table.set_active(&handles.extra, false).await;

    run_scenario!(client_bearer, server_bearer, server, client, store, async {
        client.discover().await.unwrap();
        let uuids: Vec<_> = client.services().iter().map(|s| s.uuid().clone()).collect();
        assert!(!uuids.contains(&Uuid::new_short(0x1815)));
        let before = client.services().len();

        // Drain the initial Added events.
        for _ in 0..before {
            client.next_event().await;
        }

        // Activation indicates the changed range; the client rediscovers it
        // and only then announces the service.
        server.set_service_active(&handles.extra, true).await.unwrap();

        match client.next_event().await {
            ServiceEvent::Added(svc) => {
                assert_eq!(*svc.uuid(), Uuid::new_short(0x1815));
                assert_eq!(svc.start(), handles.extra.start());
            }
            e => panic!("unexpected event {:?}", e),
        }
        assert_eq!(client.services().len(), before + 1);
    });
}

#[tokio::test(flavor = "current_thread")]
async fn concurrent_requests_are_serialized() {
    let mut table: AttributeTable<Mutex, TABLE_SIZE> = AttributeTable::new();
    let handles = build_table(&mut table);
    let store = Store::new();
    store.set(&[0x42]);
    bearer_pair!(client_bearer, server_bearer);
    let server = GattServer::<_, Mutex, TABLE_SIZE, MTU>::new(&server_bearer, &table);
    let client = GattClient::<_, Mutex, MTU>::new(&client_bearer);

    run_scenario!(client_bearer, server_bearer, server, client, store, async {
        let mut buf1 = [0u8; 32];
        let mut buf2 = [0u8; 32];
        let (r1, r2) = join(
            client.read_characteristic(&handles.battery_level, &mut buf1),
            client.read_characteristic(&Characteristic::from_raw(0x0003, None), &mut buf2),
        )
        .await;
        assert_eq!(&buf1[..r1.unwrap()], &[0x42]);
        assert_eq!(&buf2[..r2.unwrap()], DEVICE_NAME);
    });
}

#[tokio::test(flavor = "current_thread")]
async fn mismatched_response_closes_bearer() {
    let _ = env_logger::builder().is_test(true).try_init();
    let bus: TransportBus<Mutex, MTU> = TransportBus::new();
    let (ta, tb) = bus.split();
    let bearer = AttBearer::<_, Mutex, MTU>::new(ta);

    deadline(async {
        let script = async {
            let mut buf = [0u8; MTU];
            let n = tb.recv(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], &[0x0a, 0x03, 0x00]);
            // A Write Response cannot answer a Read Request.
            tb.send(&[0x13]).await.unwrap();
        };
        let request = bearer.send_request(&AttReq::Read { handle: 3 });
        let (run_result, (_, rsp)) = join(bearer.run(), join(script, request)).await;
        assert_eq!(rsp.unwrap_err(), BleHostError::BleHost(Error::InvalidResponse));
        assert_eq!(run_result.unwrap_err(), BleHostError::BleHost(Error::InvalidResponse));
        assert!(!bearer.is_connected());
        assert_eq!(bearer.disconnected().await, Error::InvalidResponse);

        // The bearer refuses further work.
        assert!(bearer.send_request(&AttReq::Read { handle: 3 }).await.is_err());
    })
    .await;
}

#[tokio::test(flavor = "current_thread")]
async fn dropped_request_does_not_leak_its_response() {
    let _ = env_logger::builder().is_test(true).try_init();
    let bus: TransportBus<Mutex, MTU> = TransportBus::new();
    let (ta, tb) = bus.split();
    let bearer = AttBearer::<_, Mutex, MTU>::new(ta);

    deadline(async {
        let scenario = async {
            // Start a request and abandon it before the response arrives.
            let abandoned = select(bearer.send_request(&AttReq::Read { handle: 1 }), core::future::ready(())).await;
            assert!(matches!(abandoned, Either::Second(())));

            let mut buf = [0u8; MTU];
            let n = tb.recv(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], &[0x0a, 0x01, 0x00]);
            // The response to the abandoned request arrives late.
            tb.send(&[0x0b, 0xde, 0xad]).await.unwrap();

            // A new request must not observe the stale response.
            let request = bearer.send_request(&AttReq::Read { handle: 2 });
            let script = async {
                let n = tb.recv(&mut buf).await.unwrap();
                assert_eq!(&buf[..n], &[0x0a, 0x02, 0x00]);
                tb.send(&[0x0b, 0x77]).await.unwrap();
            };
            let (_, rsp) = join(script, request).await;
            assert_eq!(rsp.unwrap().as_ref(), &[0x0b, 0x77]);
        };
        match select(bearer.run(), scenario).await {
            Either::First(r) => panic!("bearer stopped: {:?}", r),
            Either::Second(()) => {}
        }
    })
    .await;
}

#[tokio::test(flavor = "current_thread")]
async fn disconnect_fails_pending_request() {
    let _ = env_logger::builder().is_test(true).try_init();
    let bus: TransportBus<Mutex, MTU> = TransportBus::new();
    let (ta, tb) = bus.split();
    let bearer = AttBearer::<_, Mutex, MTU>::new(ta);

    deadline(async {
        let script = async {
            let mut buf = [0u8; MTU];
            let _ = tb.recv(&mut buf).await.unwrap();
            // Drop the link instead of answering.
            bus.close();
        };
        let request = bearer.send_request(&AttReq::Read { handle: 3 });
        let (_, (_, rsp)) = join(bearer.run(), join(script, request)).await;
        assert_eq!(rsp.unwrap_err(), BleHostError::BleHost(Error::Disconnected));
        assert_eq!(bearer.disconnected().await, Error::Disconnected);
    })
    .await;
}
