//! End-to-end tests driving the controller through decoded wire messages,
//! covering the admission/eviction/expansion scenarios from spec §4.4.

use std::collections::HashMap;

use pegasus_controller::config::{Config, L2ForwardEntry, NodeForwardEntry};
use pegasus_controller::Controller;
use pegasus_switch::NullDriver;
use pegasus_wire::{decode, Message};

fn four_node_config() -> Config {
    let mut tab_node_forward = HashMap::new();
    for i in 0..4u8 {
        tab_node_forward.insert(
            i.to_string(),
            NodeForwardEntry {
                mac: format!("00:00:00:00:00:{i:02x}"),
                ip: format!("10.0.0.{}", i + 1).parse().unwrap(),
                udp_port: 11211,
                egress_port: i as u16 + 1,
            },
        );
    }
    Config {
        bind_addr: "127.0.0.1:0".to_string(),
        tab_l2_forward: vec![L2ForwardEntry { mac: "aa:bb:cc:dd:ee:ff".to_string(), port: 1 }],
        tab_node_forward,
        tab_replicated_keys: HashMap::new(),
        max_nrkeys: 2,
        max_rset_size: 4,
        tick_interval_ms: 1000,
    }
}

fn hk_report_datagram(pairs: &[(u32, u16)]) -> Vec<u8> {
    use byteorder::{LittleEndian, WriteBytesExt};
    let mut buf = Vec::new();
    buf.write_u16::<LittleEndian>(pegasus_wire::MAGIC).unwrap();
    buf.write_u8(0x02).unwrap();
    buf.write_u16::<LittleEndian>(pairs.len() as u16).unwrap();
    for (keyhash, load) in pairs {
        buf.write_u32::<LittleEndian>(*keyhash).unwrap();
        buf.write_u16::<LittleEndian>(*load).unwrap();
    }
    buf
}

#[test]
fn admits_then_evicts_across_decoded_datagrams() {
    let config = four_node_config();
    let mut controller = Controller::bootstrap(&config, NullDriver::new()).unwrap();

    let datagram = hk_report_datagram(&[(0x1, 10), (0x2, 20)]);
    let Message::HkReport { reports } = decode(&datagram).unwrap() else {
        panic!("expected HkReport");
    };
    controller.handle_hk_report(&reports).unwrap();
    assert_eq!(controller.registry().len(), 2);
    assert!(controller.registry().contains(0x1));
    assert!(controller.registry().contains(0x2));

    let datagram = hk_report_datagram(&[(0x3, 15), (0x4, 25)]);
    let Message::HkReport { reports } = decode(&datagram).unwrap() else {
        panic!("expected HkReport");
    };
    controller.handle_hk_report(&reports).unwrap();

    assert!(controller.registry().contains(0x2));
    assert!(controller.registry().contains(0x4));
    assert!(!controller.registry().contains(0x1));
    assert!(!controller.registry().contains(0x3));
}

#[test]
fn reset_datagram_drains_tracked_state() {
    let config = four_node_config();
    let mut controller = Controller::bootstrap(&config, NullDriver::new()).unwrap();
    controller.handle_hk_report(&[pegasus_wire::Report { keyhash: 0x1, load: 10 }]).unwrap();
    assert_eq!(controller.registry().len(), 1);

    let mut buf = Vec::new();
    {
        use byteorder::{LittleEndian, WriteBytesExt};
        buf.write_u16::<LittleEndian>(pegasus_wire::MAGIC).unwrap();
        buf.write_u8(0x00).unwrap();
        buf.write_u16::<LittleEndian>(8).unwrap();
    }
    let Message::ResetRequest { num_nodes } = decode(&buf).unwrap() else {
        panic!("expected ResetRequest");
    };
    controller.reset(num_nodes).unwrap();

    assert!(controller.registry().is_empty());
    assert_eq!(controller.num_nodes(), 8);
}

#[test]
fn reconcile_expands_replica_set_under_pressure() {
    let config = four_node_config();
    let mut controller = Controller::bootstrap(&config, NullDriver::new()).unwrap();
    controller.handle_hk_report(&[pegasus_wire::Report { keyhash: 0x3, load: 50 }]).unwrap();
    assert_eq!(controller.registry().get(0x3).unwrap().nodes.len(), 1);

    // Seed the load registers the way the switch ASIC would have; node 2
    // is idle while the rest of the fleet is saturated.
    for (node, load) in [(0u8, 100u16), (1, 100), (2, 0), (3, 100)] {
        controller.driver_mut().set_node_load(node, load);
    }

    let events = controller.reconcile().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].keyhash, 0x3);
    assert_eq!(events[0].dst, 2);
    assert_eq!(controller.registry().get(0x3).unwrap().nodes.len(), 2);
}
