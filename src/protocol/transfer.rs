//! Compressed block framing.
//!
//! | Byte  | Frame                                   |
//! |-------|-----------------------------------------|
//! | `SOH` | `len title NUL offset NUL` header       |
//! | `STX` | `n` followed by `n` data bytes (0=256)  |
//! | `EOT` | negated sum of all data bytes, mod 256  |

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::header::{latin1_to_string, string_to_latin1};
use super::line::{clean_line, err_line};
use super::mailbox::{Direction, Status, StatusReporter};
use super::proposal::{Proposal, MIN_COMPRESSED_SIZE};
use crate::error::{B2FError, Result};

pub(crate) const CHR_NUL: u8 = 0x00;
pub(crate) const CHR_SOH: u8 = 0x01;
pub(crate) const CHR_STX: u8 = 0x02;
pub(crate) const CHR_EOT: u8 = 0x04;

/// Largest data chunk written per STX frame.
pub const MAX_CHUNK_SIZE: usize = 125;

/// Longest title that keeps the header length in one byte.
const MAX_TITLE_LEN: usize = 80;

fn status(prop: &Proposal, transferred: usize, direction: Direction, done: bool) -> Status {
    Status {
        mid: prop.mid().to_string(),
        title: prop.title().to_string(),
        bytes_transferred: transferred,
        bytes_total: prop.compressed_size(),
        direction,
        done,
    }
}

/// Transmit the compressed payload of an accepted proposal from its offset.
pub(crate) async fn write_compressed<W: AsyncWrite + Unpin>(
    wr: &mut W,
    prop: &Proposal,
    reporter: Option<&StatusReporter>,
) -> Result<()> {
    let data = prop.compressed_data();
    if data.len() < MIN_COMPRESSED_SIZE {
        return Err(B2FError::Compression(format!(
            "compressed payload of {} is too short",
            prop.mid()
        )));
    }
    if prop.offset() > data.len() {
        return Err(B2FError::Protocol(format!(
            "offset {} is beyond the end of {}",
            prop.offset(),
            prop.mid()
        )));
    }

    let mut title = string_to_latin1(prop.title());
    title.truncate(MAX_TITLE_LEN);
    let offset = prop.offset().to_string();

    let mut header = Vec::with_capacity(title.len() + offset.len() + 4);
    header.push(CHR_SOH);
    header.push((title.len() + offset.len() + 2) as u8);
    header.extend_from_slice(&title);
    header.push(CHR_NUL);
    header.extend_from_slice(offset.as_bytes());
    header.push(CHR_NUL);
    wr.write_all(&header).await?;

    tracing::info!(
        "Transmitting [{}] [offset {}]",
        latin1_to_string(&title),
        prop.offset()
    );

    let mut sum: u8 = 0;
    let mut transferred = prop.offset();
    for chunk in data[prop.offset()..].chunks(MAX_CHUNK_SIZE) {
        wr.write_all(&[CHR_STX, chunk.len() as u8]).await?;
        wr.write_all(chunk).await?;
        wr.flush().await?;

        sum = chunk.iter().fold(sum, |acc, &b| acc.wrapping_add(b));
        transferred += chunk.len();
        if let Some(r) = reporter {
            r.report(status(prop, transferred, Direction::Sending, false));
        }
    }

    let checksum = sum.wrapping_neg();
    wr.write_all(&[CHR_EOT, checksum]).await?;
    wr.flush().await?;

    if let Some(r) = reporter {
        r.report(status(prop, transferred, Direction::Sending, true));
    }
    Ok(())
}

async fn read_byte<R: AsyncBufRead + Unpin>(rd: &mut R) -> Result<u8> {
    match rd.read_u8().await {
        Ok(b) => Ok(b),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(B2FError::Eof),
        Err(e) => Err(e.into()),
    }
}

async fn read_field<R: AsyncBufRead + Unpin>(rd: &mut R) -> Result<Vec<u8>> {
    let mut field = Vec::new();
    rd.read_until(CHR_NUL, &mut field).await?;
    if field.pop() != Some(CHR_NUL) {
        return Err(B2FError::Eof);
    }
    Ok(field)
}

/// Receive the compressed payload of an accepted proposal.
pub(crate) async fn read_compressed<R: AsyncBufRead + Unpin>(
    rd: &mut R,
    prop: &mut Proposal,
    reporter: Option<&StatusReporter>,
) -> Result<()> {
    match read_byte(rd).await? {
        CHR_SOH => {},
        b'*' => {
            let mut rest = Vec::new();
            rd.read_until(b'\r', &mut rest).await?;
            let line = clean_line(&format!("*{}", latin1_to_string(&rest)));
            return Err(err_line(&line).unwrap_or(B2FError::RemoteError(line)));
        },
        other => {
            return Err(B2FError::Protocol(format!(
                "Unexpected byte in compressed stream: {other:#04x}"
            )))
        },
    }

    let header_len = usize::from(read_byte(rd).await?);
    let title = read_field(rd).await?;
    let offset = read_field(rd).await?;
    if title.len() + offset.len() + 2 != header_len {
        return Err(B2FError::Protocol("Header length mismatch".to_string()));
    }
    let offset = latin1_to_string(&offset);
    if offset != "0" {
        return Err(B2FError::Protocol(format!(
            "Got unexpected offset {offset} for {}",
            prop.mid()
        )));
    }
    prop.set_title(latin1_to_string(&title));
    tracing::info!("Receiving [{}] [offset {}]", prop.title(), offset);

    let mut buf = Vec::with_capacity(prop.compressed_size());
    let mut sum: u8 = 0;
    loop {
        match read_byte(rd).await? {
            CHR_STX => {
                let n = match read_byte(rd).await? {
                    0 => 256,
                    n => usize::from(n),
                };
                let start = buf.len();
                if start + n > prop.compressed_size() {
                    return Err(B2FError::Protocol(format!(
                        "Received more than {} bytes of {}",
                        prop.compressed_size(),
                        prop.mid()
                    )));
                }
                buf.resize(start + n, 0);
                rd.read_exact(&mut buf[start..]).await.map_err(|e| {
                    if e.kind() == std::io::ErrorKind::UnexpectedEof {
                        B2FError::Eof
                    } else {
                        e.into()
                    }
                })?;
                sum = buf[start..].iter().fold(sum, |acc, &b| acc.wrapping_add(b));

                if let Some(r) = reporter {
                    r.report(status(prop, buf.len(), Direction::Receiving, false));
                }
            },
            CHR_EOT => {
                let checksum = read_byte(rd).await?;
                if sum.wrapping_add(checksum) != 0 {
                    return Err(B2FError::BadChecksum);
                }
                if buf.len() != prop.compressed_size() {
                    return Err(B2FError::Protocol(format!(
                        "Received {} bytes of {}, expected {}",
                        buf.len(),
                        prop.mid(),
                        prop.compressed_size()
                    )));
                }
                let received = buf.len();
                prop.set_compressed_data(buf);
                if let Some(r) = reporter {
                    r.report(status(prop, received, Direction::Receiving, true));
                }
                return Ok(());
            },
            other => {
                return Err(B2FError::Protocol(format!(
                    "Unexpected byte in compressed stream: {other:#04x}"
                )))
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ProposalCode;
    use crate::protocol::proposal::ProposalAnswer;
    use tokio::io::BufReader;

    fn outbound(len: usize) -> Proposal {
        let data: Vec<u8> = (0..len).map(|i| (i * 31 % 251) as u8).collect();
        Proposal::new("TESTMID", "Test subject", ProposalCode::Wl2k, &data).unwrap()
    }

    fn inbound_for(p: &Proposal) -> Proposal {
        let line = format!(
            "FC EM {} {} {} 0",
            p.mid(),
            p.size(),
            p.compressed_size()
        );
        let mut prop = Proposal::parse(&line).unwrap();
        prop.set_answer(ProposalAnswer::Accept);
        prop
    }

    #[tokio::test]
    async fn test_block_roundtrip() {
        let sent = outbound(4000);
        let mut wire = Vec::new();
        write_compressed(&mut wire, &sent, None).await.unwrap();

        assert_eq!(wire[0], CHR_SOH);
        assert_eq!(wire[1] as usize, "Test subject".len() + 1 + 2);
        assert_eq!(*wire.iter().rev().nth(1).unwrap(), CHR_EOT);

        let mut recv = inbound_for(&sent);
        let mut rd = BufReader::new(&wire[..]);
        read_compressed(&mut rd, &mut recv, None).await.unwrap();
        assert_eq!(recv.title(), "Test subject");
        assert!(recv.data_is_complete());
        assert_eq!(recv.data().unwrap(), sent.data().unwrap());
    }

    #[tokio::test]
    async fn test_bad_checksum() {
        let sent = outbound(300);
        let mut wire = Vec::new();
        write_compressed(&mut wire, &sent, None).await.unwrap();
        let last = wire.len() - 1;
        wire[last] = wire[last].wrapping_add(1);

        let mut recv = inbound_for(&sent);
        let mut rd = BufReader::new(&wire[..]);
        assert!(matches!(
            read_compressed(&mut rd, &mut recv, None).await,
            Err(B2FError::BadChecksum)
        ));
    }

    #[tokio::test]
    async fn test_remote_error_instead_of_block() {
        let mut recv = inbound_for(&outbound(100));
        let mut rd = BufReader::new(&b"*** Transfer aborted\r"[..]);
        match read_compressed(&mut rd, &mut recv, None).await {
            Err(B2FError::RemoteError(msg)) => assert_eq!(msg, "Transfer aborted"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rejects_offset_and_bad_header() {
        let mut recv = inbound_for(&outbound(100));
        let mut rd = BufReader::new(&b"\x01\x08title\x005\x00"[..]);
        assert!(matches!(
            read_compressed(&mut rd, &mut recv, None).await,
            Err(B2FError::Protocol(_))
        ));

        let mut rd = BufReader::new(&b"\x01\x09title\x000\x00"[..]);
        assert!(matches!(
            read_compressed(&mut rd, &mut recv, None).await,
            Err(B2FError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_length_mismatch() {
        let sent = outbound(500);
        let mut wire = Vec::new();
        write_compressed(&mut wire, &sent, None).await.unwrap();

        let line = format!("FC EM TESTMID {} {} 0", sent.size(), sent.compressed_size() + 1);
        let mut recv = Proposal::parse(&line).unwrap();
        let mut rd = BufReader::new(&wire[..]);
        assert!(matches!(
            read_compressed(&mut rd, &mut recv, None).await,
            Err(B2FError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_frames_rejected_before_eot() {
        let mut recv = Proposal::parse("FC EM TESTMID 200 100 0").unwrap();
        recv.set_answer(ProposalAnswer::Accept);

        // One full frame and no EOT: the frame alone exceeds the proposal.
        let mut wire = b"\x01\x08title\x000\x00\x02\x00".to_vec();
        wire.extend(std::iter::repeat(0x55).take(256));
        let mut rd = BufReader::new(&wire[..]);
        assert!(matches!(
            read_compressed(&mut rd, &mut recv, None).await,
            Err(B2FError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_write_from_offset() {
        let mut sent = outbound(2000);
        let total = sent.compressed_size();
        parse_offset(&mut sent, 130);

        let mut wire = Vec::new();
        write_compressed(&mut wire, &sent, None).await.unwrap();
        let header_len = 2 + wire[1] as usize;
        assert_eq!(&wire[2..header_len], b"Test subject\x00130\x00");
        let data_frames = wire.len() - header_len - 2;
        let chunks = (total - 130).div_ceil(MAX_CHUNK_SIZE);
        assert_eq!(data_frames, total - 130 + 2 * chunks);
    }

    fn parse_offset(prop: &mut Proposal, offset: usize) {
        let mut block = vec![prop.clone()];
        crate::protocol::proposal::parse_answer_line(&format!("FS !{offset}"), &mut block)
            .unwrap();
        *prop = block.remove(0);
    }
}
