//! Binary capture format: a stream of length-prefixed packets.
//!
//! Every packet starts with a 16-byte little-endian header
//! `{bytes: u32, type: u16, user: u16, time_us: u64}` where `bytes` counts
//! the header itself. Inertial payloads are `f32` triples. Camera payloads
//! carry a 16-byte ASCII `P5 <width> <height>` header followed by 8-bit
//! pixels.

use std::io::{ErrorKind, Read, Write};

use nalgebra::Vector3;

use crate::error::{FusionError, Result};
use crate::sensor::{AccelerometerSample, GyroSample, Timestamp};

pub const HEADER_BYTES: usize = 16;
const IMAGE_HEADER_BYTES: usize = 16;

pub const PACKET_CAMERA: u16 = 1;
pub const PACKET_IMU: u16 = 2;
pub const PACKET_ACCELEROMETER: u16 = 20;
pub const PACKET_GYROSCOPE: u16 = 21;
pub const PACKET_FILTER_CONTROL: u16 = 25;

/// `user` value of a control packet that marks the reference pose.
pub const CONTROL_SET_REFERENCE: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub bytes: u32,
    pub kind: u16,
    pub user: u16,
    pub time_us: u64,
}

impl PacketHeader {
    fn parse(raw: &[u8; HEADER_BYTES]) -> Self {
        Self {
            bytes: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            kind: u16::from_le_bytes([raw[4], raw[5]]),
            user: u16::from_le_bytes([raw[6], raw[7]]),
            time_us: u64::from_le_bytes([raw[8], raw[9], raw[10], raw[11], raw[12], raw[13], raw[14], raw[15]]),
        }
    }

    fn encode(&self) -> [u8; HEADER_BYTES] {
        let mut raw = [0u8; HEADER_BYTES];
        raw[0..4].copy_from_slice(&self.bytes.to_le_bytes());
        raw[4..6].copy_from_slice(&self.kind.to_le_bytes());
        raw[6..8].copy_from_slice(&self.user.to_le_bytes());
        raw[8..16].copy_from_slice(&self.time_us.to_le_bytes());
        raw
    }

    pub fn timestamp(&self) -> Timestamp {
        Timestamp(self.time_us)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Camera {
        time: Timestamp,
        width: usize,
        height: usize,
        pixels: Vec<u8>,
    },
    Accelerometer(AccelerometerSample),
    Gyroscope(GyroSample),
    /// Accelerometer and gyro read at the same instant.
    Imu {
        accel: AccelerometerSample,
        gyro: GyroSample,
    },
    FilterControl {
        time: Timestamp,
        code: u16,
    },
    /// Kept so readers can skip record types they do not handle.
    Unknown(PacketHeader),
}

impl Packet {
    pub fn time(&self) -> Timestamp {
        match self {
            Packet::Camera { time, .. } | Packet::FilterControl { time, .. } => *time,
            Packet::Accelerometer(sample) => sample.timestamp,
            Packet::Gyroscope(sample) => sample.timestamp,
            Packet::Imu { accel, .. } => accel.timestamp,
            Packet::Unknown(header) => header.timestamp(),
        }
    }

    fn decode(header: PacketHeader, payload: &[u8]) -> Result<Self> {
        let time = header.timestamp();
        let packet = match header.kind {
            PACKET_CAMERA => {
                let (width, height) = parse_image_header(payload)?;
                let required = width
                    .checked_mul(height)
                    .and_then(|pixels| pixels.checked_add(IMAGE_HEADER_BYTES))
                    .ok_or_else(|| FusionError::MalformedPacket(format!("{}x{} image is too large", width, height)))?;
                if payload.len() < required {
                    return Err(FusionError::TruncatedPacket {
                        required,
                        available: payload.len(),
                    });
                }
                Packet::Camera {
                    time,
                    width,
                    height,
                    pixels: payload[IMAGE_HEADER_BYTES..required].to_vec(),
                }
            }
            PACKET_ACCELEROMETER => Packet::Accelerometer(AccelerometerSample::new(time, read_vector(payload, 0)?)),
            PACKET_GYROSCOPE => Packet::Gyroscope(GyroSample::new(time, read_vector(payload, 0)?)),
            PACKET_IMU => Packet::Imu {
                accel: AccelerometerSample::new(time, read_vector(payload, 0)?),
                gyro: GyroSample::new(time, read_vector(payload, 12)?),
            },
            PACKET_FILTER_CONTROL => Packet::FilterControl { time, code: header.user },
            _ => Packet::Unknown(header),
        };
        Ok(packet)
    }

    fn encode(&self) -> Result<(PacketHeader, Vec<u8>)> {
        let mut user = 0;
        let (kind, payload) = match self {
            Packet::Camera {
                width, height, pixels, ..
            } => {
                let mut payload = image_header(*width, *height)?.to_vec();
                payload.extend_from_slice(pixels);
                (PACKET_CAMERA, payload)
            }
            Packet::Accelerometer(sample) => (PACKET_ACCELEROMETER, vector_bytes(&sample.accel_m_s2).to_vec()),
            Packet::Gyroscope(sample) => (PACKET_GYROSCOPE, vector_bytes(&sample.angvel_rad_s).to_vec()),
            Packet::Imu { accel, gyro } => {
                let mut payload = vector_bytes(&accel.accel_m_s2).to_vec();
                payload.extend_from_slice(&vector_bytes(&gyro.angvel_rad_s));
                (PACKET_IMU, payload)
            }
            Packet::FilterControl { code, .. } => {
                user = *code;
                (PACKET_FILTER_CONTROL, Vec::new())
            }
            Packet::Unknown(header) => {
                return Err(FusionError::MalformedPacket(format!("cannot write unknown packet type {}", header.kind)))
            }
        };
        let header = PacketHeader {
            bytes: (HEADER_BYTES + payload.len()) as u32,
            kind,
            user,
            time_us: self.time().as_micros(),
        };
        Ok((header, payload))
    }
}

fn parse_image_header(payload: &[u8]) -> Result<(usize, usize)> {
    if payload.len() < IMAGE_HEADER_BYTES {
        return Err(FusionError::TruncatedPacket {
            required: IMAGE_HEADER_BYTES,
            available: payload.len(),
        });
    }
    let text = String::from_utf8_lossy(&payload[..IMAGE_HEADER_BYTES]);
    let mut fields = text.split_whitespace();
    if fields.next() != Some("P5") {
        return Err(FusionError::MalformedPacket(format!("bad image header {:?}", text)));
    }
    let mut dimension = || -> Result<usize> {
        fields
            .next()
            .and_then(|field| field.parse().ok())
            .ok_or_else(|| FusionError::MalformedPacket(format!("bad image header {:?}", text)))
    };
    let width = dimension()?;
    let height = dimension()?;
    Ok((width, height))
}

fn image_header(width: usize, height: usize) -> Result<[u8; IMAGE_HEADER_BYTES]> {
    let text = format!("P5 {} {} 255", width, height);
    if text.len() >= IMAGE_HEADER_BYTES {
        return Err(FusionError::MalformedPacket(format!("image {}x{} too large for header", width, height)));
    }
    let mut raw = [b' '; IMAGE_HEADER_BYTES];
    raw[..text.len()].copy_from_slice(text.as_bytes());
    raw[IMAGE_HEADER_BYTES - 1] = b'\n';
    Ok(raw)
}

fn read_vector(payload: &[u8], offset: usize) -> Result<Vector3<f64>> {
    let required = offset + 12;
    let bytes = payload.get(offset..required).ok_or(FusionError::TruncatedPacket {
        required,
        available: payload.len(),
    })?;
    let component = |k: usize| f32::from_le_bytes([bytes[4 * k], bytes[4 * k + 1], bytes[4 * k + 2], bytes[4 * k + 3]]) as f64;
    Ok(Vector3::new(component(0), component(1), component(2)))
}

fn vector_bytes(v: &Vector3<f64>) -> [u8; 12] {
    let mut raw = [0u8; 12];
    for k in 0..3 {
        raw[4 * k..4 * k + 4].copy_from_slice(&(v[k] as f32).to_le_bytes());
    }
    raw
}

/// Reads packets one at a time from a capture stream.
pub struct PacketReader<R: Read> {
    inner: R,
    bytes_read: u64,
}

impl<R: Read> PacketReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, bytes_read: 0 }
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Returns `Ok(None)` at a clean end of stream. A stream that ends
    /// inside a packet is an error.
    pub fn next_packet(&mut self) -> Result<Option<Packet>> {
        let mut raw = [0u8; HEADER_BYTES];
        let got = self.fill(&mut raw)?;
        if got == 0 {
            return Ok(None);
        }
        if got < HEADER_BYTES {
            return Err(FusionError::TruncatedPacket {
                required: HEADER_BYTES,
                available: got,
            });
        }
        let header = PacketHeader::parse(&raw);
        let total = header.bytes as usize;
        if total < HEADER_BYTES {
            return Err(FusionError::MalformedPacket(format!("packet length {} is shorter than its header", total)));
        }

        let mut payload = vec![0u8; total - HEADER_BYTES];
        let got = self.fill(&mut payload)?;
        if got < payload.len() {
            return Err(FusionError::TruncatedPacket {
                required: total,
                available: HEADER_BYTES + got,
            });
        }
        Packet::decode(header, &payload).map(Some)
    }

    fn fill(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        self.bytes_read += filled as u64;
        Ok(filled)
    }
}

impl<R: Read> Iterator for PacketReader<R> {
    type Item = Result<Packet>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_packet().transpose()
    }
}

pub struct PacketWriter<W: Write> {
    inner: W,
    packets: usize,
}

impl<W: Write> PacketWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, packets: 0 }
    }

    pub fn write_packet(&mut self, packet: &Packet) -> Result<()> {
        let (header, payload) = packet.encode()?;
        self.inner.write_all(&header.encode())?;
        self.inner.write_all(&payload)?;
        self.packets += 1;
        Ok(())
    }

    pub fn packets_written(&self) -> usize {
        self.packets
    }

    pub fn into_inner(mut self) -> Result<W> {
        self.inner.flush()?;
        Ok(self.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::io::Cursor;

    fn capture(packets: &[Packet]) -> Vec<u8> {
        let mut writer = PacketWriter::new(Vec::new());
        for packet in packets {
            writer.write_packet(packet).unwrap();
        }
        writer.into_inner().unwrap()
    }

    #[test]
    fn test_header_layout() {
        let bytes = capture(&[Packet::FilterControl {
            time: Timestamp(0x0102_0304_0506_0708),
            code: CONTROL_SET_REFERENCE,
        }]);
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[0..4], &16u32.to_le_bytes());
        assert_eq!(&bytes[4..6], &25u16.to_le_bytes());
        assert_eq!(&bytes[6..8], &1u16.to_le_bytes());
        assert_eq!(&bytes[8..16], &[8, 7, 6, 5, 4, 3, 2, 1]);
    }

    #[test]
    fn test_mixed_capture_reads_back() {
        let accel = AccelerometerSample::new(Timestamp(1_000), Vector3::new(0.1, -0.2, 9.81));
        let gyro = GyroSample::new(Timestamp(1_500), Vector3::new(0.01, 0.02, -0.03));
        let pixels: Vec<u8> = (0..12).collect();
        let packets = vec![
            Packet::Accelerometer(accel),
            Packet::Gyroscope(gyro),
            Packet::Camera {
                time: Timestamp(2_000),
                width: 4,
                height: 3,
                pixels: pixels.clone(),
            },
            Packet::Imu { accel, gyro: GyroSample::new(Timestamp(1_000), gyro.angvel_rad_s) },
        ];
        let bytes = capture(&packets);

        let mut reader = PacketReader::new(Cursor::new(bytes.clone()));
        let read: Vec<Packet> = reader.by_ref().collect::<Result<_>>().unwrap();
        assert_eq!(read.len(), 4);
        assert_eq!(reader.bytes_read(), bytes.len() as u64);

        match &read[0] {
            Packet::Accelerometer(sample) => {
                assert_eq!(sample.timestamp, Timestamp(1_000));
                assert_relative_eq!(sample.accel_m_s2, accel.accel_m_s2, epsilon = 1e-6);
            }
            other => panic!("unexpected {:?}", other),
        }
        match &read[2] {
            Packet::Camera { width, height, pixels: got, .. } => {
                assert_eq!((*width, *height), (4, 3));
                assert_eq!(got, &pixels);
            }
            other => panic!("unexpected {:?}", other),
        }
        match &read[3] {
            Packet::Imu { accel: a, gyro: g } => {
                assert_eq!(a.timestamp, g.timestamp);
                assert_relative_eq!(g.angvel_rad_s, gyro.angvel_rad_s, epsilon = 1e-6);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_is_skipped() {
        let mut bytes = PacketHeader {
            bytes: 20,
            kind: 99,
            user: 0,
            time_us: 5,
        }
        .encode()
        .to_vec();
        bytes.extend_from_slice(&[0xAA; 4]);
        bytes.extend_from_slice(&capture(&[Packet::FilterControl {
            time: Timestamp(6),
            code: 1,
        }]));

        let mut reader = PacketReader::new(Cursor::new(bytes));
        assert!(matches!(reader.next_packet().unwrap(), Some(Packet::Unknown(h)) if h.kind == 99));
        assert_eq!(
            reader.next_packet().unwrap(),
            Some(Packet::FilterControl {
                time: Timestamp(6),
                code: 1
            })
        );
        assert!(reader.next_packet().unwrap().is_none());
    }

    #[test]
    fn test_truncated_stream() {
        let mut bytes = capture(&[Packet::Gyroscope(GyroSample::new(Timestamp(1), Vector3::zeros()))]);
        bytes.truncate(20);
        let mut reader = PacketReader::new(Cursor::new(bytes));
        assert!(matches!(
            reader.next_packet(),
            Err(FusionError::TruncatedPacket {
                required: 28,
                available: 20
            })
        ));

        let mut reader = PacketReader::new(Cursor::new(vec![1u8, 2, 3]));
        assert!(matches!(reader.next_packet(), Err(FusionError::TruncatedPacket { .. })));
    }

    #[test]
    fn test_bad_image_header() {
        let mut payload = b"P6 4 3 255      ".to_vec();
        payload.extend_from_slice(&[0; 12]);
        let header = PacketHeader {
            bytes: (HEADER_BYTES + payload.len()) as u32,
            kind: PACKET_CAMERA,
            user: 0,
            time_us: 1,
        };
        assert!(matches!(Packet::decode(header, &payload), Err(FusionError::MalformedPacket(_))));

        let short = b"P5 4 3 255      ".to_vec();
        assert!(matches!(
            Packet::decode(header, &short),
            Err(FusionError::TruncatedPacket { required: 28, .. })
        ));
    }

    #[test]
    fn test_length_shorter_than_header() {
        let bytes = PacketHeader {
            bytes: 8,
            kind: PACKET_GYROSCOPE,
            user: 0,
            time_us: 1,
        }
        .encode();
        let mut reader = PacketReader::new(Cursor::new(bytes.to_vec()));
        assert!(matches!(reader.next_packet(), Err(FusionError::MalformedPacket(_))));
    }
}
