//! RFID 分包传输端到端用例：从原始 CAN 帧经解码器进重组器

use feeder_cabinet::can::FeederFrame;
use feeder_cabinet::protocol::ids::CABINET_TO_PRINTER_ID;
use feeder_cabinet::protocol::messages::decode;
use feeder_cabinet::protocol::opentag::MIN_RECORD_LEN;
use feeder_cabinet::protocol::rfid::{RfidEvent, RfidReassembler, SessionAbortReason};
use std::time::Duration;

fn feed(r: &mut RfidReassembler, data: &[u8]) -> Vec<RfidEvent> {
    let frame = FeederFrame::new(CABINET_TO_PRINTER_ID, data);
    let msg = decode(&frame).expect("frame must decode");
    r.handle_message(&msg)
}

fn wrapping_sum(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |acc, &b| acc.wrapping_add(b as u16))
}

/// 按协议把负载切成 0x17 数据帧
fn data_frames(seq: u8, payload: &[u8]) -> Vec<Vec<u8>> {
    payload
        .chunks(4)
        .enumerate()
        .map(|(i, chunk)| {
            let mut frame = vec![0x17, seq, (i + 1) as u8, chunk.len() as u8];
            frame.extend_from_slice(chunk);
            frame.resize(8, 0);
            frame
        })
        .collect()
}

/// 典型 OpenTag 负载：148 字节（含全部可选字段）
fn opentag_payload() -> Vec<u8> {
    let mut buf = vec![0u8; 148];
    buf[0] = 1; // tag_version = 1 (LE)
    buf[2..2 + 6].copy_from_slice(b"Mingda"); // manufacturer
    buf[18..18 + 3].copy_from_slice(b"PLA"); // material
    buf[34..34 + 5].copy_from_slice(b"Black"); // color name
    buf[66..68].copy_from_slice(&1750u16.to_le_bytes()); // diameter
    buf[68..70].copy_from_slice(&1000u16.to_le_bytes()); // weight
    buf[70..72].copy_from_slice(&215u16.to_le_bytes()); // print temp
    buf[72..74].copy_from_slice(&60u16.to_le_bytes()); // bed temp
    buf[74..76].copy_from_slice(&1240u16.to_le_bytes()); // density
    buf
}

#[test]
fn notify_transfer_of_148_bytes_completes_with_parsed_record() {
    let mut r = RfidReassembler::new(Duration::from_secs(10));
    let payload = opentag_payload();
    let seq = 0x07;

    // 起始帧：37 包 / 148 字节 / 挤出机未映射 / RFID 来源
    let events = feed(&mut r, &[0x14, seq, 0x00, 0x25, 0x00, 0x94, 0xFF, 0x00]);
    assert!(matches!(
        events.as_slice(),
        [RfidEvent::TransferStarted {
            expected_len: 148,
            ..
        }]
    ));

    let frames = data_frames(seq, &payload);
    assert_eq!(frames.len(), 37);
    for frame in &frames {
        assert!(feed(&mut r, frame).is_empty());
    }

    // 结束帧：包数 + 16 位累加和（高字节在前）
    let sum = wrapping_sum(&payload);
    let events = feed(
        &mut r,
        &[0x18, seq, 0x25, (sum >> 8) as u8, (sum & 0xFF) as u8, 0x00, 0, 0],
    );
    match events.as_slice() {
        [RfidEvent::TransferComplete { raw, record, .. }] => {
            assert_eq!(raw, &payload);
            let record = record.as_ref().expect("record must parse");
            assert_eq!(record.manufacturer, "Mingda");
            assert_eq!(record.material_name, "PLA");
            assert_eq!(record.color_name, "Black");
            assert_eq!(record.print_temp, 215);
            assert_eq!(record.bed_temp, 60);
        }
        other => panic!("unexpected events: {:?}", other),
    }
}

#[test]
fn flipped_byte_aborts_with_checksum_error_and_next_transfer_succeeds() {
    let mut r = RfidReassembler::new(Duration::from_secs(10));
    let payload = opentag_payload();
    let good_sum = wrapping_sum(&payload);
    let seq = 0x08;

    feed(&mut r, &[0x14, seq, 0x00, 0x25, 0x00, 0x94, 0x00, 0x00]);
    let mut corrupted = payload.clone();
    corrupted[40] ^= 0xFF;
    for frame in data_frames(seq, &corrupted) {
        feed(&mut r, &frame);
    }
    // 结束帧仍声明原始校验和
    let events = feed(
        &mut r,
        &[
            0x18,
            seq,
            0x25,
            (good_sum >> 8) as u8,
            (good_sum & 0xFF) as u8,
            0x00,
            0,
            0,
        ],
    );
    assert!(matches!(
        events.as_slice(),
        [RfidEvent::TransferAborted {
            reason: SessionAbortReason::ChecksumError { .. },
            ..
        }]
    ));

    // 下一次 NOTIFY 正常接受并完成
    let seq2 = 0x09;
    feed(&mut r, &[0x14, seq2, 0x00, 0x25, 0x00, 0x94, 0x00, 0x00]);
    for frame in data_frames(seq2, &payload) {
        feed(&mut r, &frame);
    }
    let events = feed(
        &mut r,
        &[
            0x18,
            seq2,
            0x25,
            (good_sum >> 8) as u8,
            (good_sum & 0xFF) as u8,
            0x00,
            0,
            0,
        ],
    );
    assert!(matches!(
        events.as_slice(),
        [RfidEvent::TransferComplete { .. }]
    ));
}

#[test]
fn zero_length_transfer_yields_empty_completion() {
    let mut r = RfidReassembler::new(Duration::from_secs(10));
    feed(&mut r, &[0x14, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
    let events = feed(&mut r, &[0x18, 0x01, 0x00, 0x00, 0x00, 0x00, 0, 0]);
    match events.as_slice() {
        [RfidEvent::TransferComplete { raw, record, .. }] => {
            assert!(raw.is_empty());
            assert!(record.is_none());
        }
        other => panic!("unexpected events: {:?}", other),
    }
}

#[test]
fn response_start_uses_swapped_field_layout() {
    let mut r = RfidReassembler::new(Duration::from_secs(10));
    // 0x16：第 2 字节挤出机、第 6 字节料管
    let events = feed(
        &mut r,
        &[0x16, 0x11, 0x01, 0x01, 0x00, 0x04, 0x00, 0x00],
    );
    match events.as_slice() {
        [RfidEvent::TransferStarted {
            extruder, channel, ..
        }] => {
            assert_eq!(*extruder, 1);
            assert_eq!(*channel, 0);
        }
        other => panic!("unexpected events: {:?}", other),
    }

    feed(&mut r, &[0x17, 0x11, 0x01, 0x04, 0xDE, 0xAD, 0xBE, 0xEF]);
    let sum = wrapping_sum(&[0xDE, 0xAD, 0xBE, 0xEF]);
    let events = feed(
        &mut r,
        &[0x18, 0x11, 0x01, (sum >> 8) as u8, (sum & 0xFF) as u8, 0, 0, 0],
    );
    match events.as_slice() {
        [RfidEvent::TransferComplete { raw, extruder, .. }] => {
            assert_eq!(raw, &[0xDE, 0xAD, 0xBE, 0xEF]);
            assert_eq!(*extruder, 1);
        }
        other => panic!("unexpected events: {:?}", other),
    }
}

#[test]
fn error_frame_cancels_session_for_extruder() {
    let mut r = RfidReassembler::new(Duration::from_secs(10));
    feed(
        &mut r,
        &[0x16, 0x21, 0x00, 0x13, 0x00, MIN_RECORD_LEN as u8, 0x00, 0x00],
    );
    assert_eq!(r.active_sessions(), 1);

    // 读取失败（无标签）
    let events = feed(&mut r, &[0x19, 0x21, 0x00, 0x01, 0x03, 0, 0, 0]);
    assert!(events.iter().any(|e| matches!(
        e,
        RfidEvent::TransferAborted {
            reason: SessionAbortReason::CabinetError {
                code: 0x01,
                ext_code: 0x03
            },
            ..
        }
    )));
    assert!(events
        .iter()
        .any(|e| matches!(e, RfidEvent::ReadError { .. })));
    assert_eq!(r.active_sessions(), 0);
}

#[test]
fn partial_final_packet_carries_remainder() {
    // 6 字节 = 4 + 2：末包 valid_count = 2
    let mut r = RfidReassembler::new(Duration::from_secs(10));
    let payload = [1u8, 2, 3, 4, 5, 6];
    feed(&mut r, &[0x14, 0x31, 0x00, 0x02, 0x00, 0x06, 0x00, 0x00]);
    feed(&mut r, &[0x17, 0x31, 0x01, 0x04, 1, 2, 3, 4]);
    feed(&mut r, &[0x17, 0x31, 0x02, 0x02, 5, 6, 0, 0]);
    let sum = wrapping_sum(&payload);
    let events = feed(
        &mut r,
        &[0x18, 0x31, 0x02, (sum >> 8) as u8, (sum & 0xFF) as u8, 0, 0, 0],
    );
    match events.as_slice() {
        [RfidEvent::TransferComplete { raw, .. }] => assert_eq!(raw, &payload),
        other => panic!("unexpected events: {:?}", other),
    }
}
