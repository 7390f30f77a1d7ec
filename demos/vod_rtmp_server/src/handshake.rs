//! The plain RTMP handshake.  Flash players accept it without the digest variant as long
//! as S2 echoes C1.

use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const RTMP_VERSION: u8 = 3;
const PACKET_SIZE: usize = 1536;

/// Runs the server side of the handshake.  Everything the peer sends after C2 is left
/// unread on the stream.
pub async fn perform_handshake<S>(stream: &mut S) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let version = stream.read_u8().await?;
    if version != RTMP_VERSION {
        return Err(format!("Unsupported RTMP version {}", version).into());
    }

    let mut c1 = vec![0_u8; PACKET_SIZE];
    stream.read_exact(&mut c1).await?;

    let mut response = Vec::with_capacity(1 + PACKET_SIZE * 2);
    response.push(RTMP_VERSION);

    // S1 is a zero time, zero version, then random bytes
    let mut s1 = vec![0_u8; PACKET_SIZE];
    rand::thread_rng().fill_bytes(&mut s1[8..]);
    response.extend_from_slice(&s1);
    response.extend_from_slice(&c1);
    stream.write_all(&response).await?;

    let mut c2 = vec![0_u8; PACKET_SIZE];
    stream.read_exact(&mut c2).await?;
    if c2[8..] != s1[8..] {
        tracing::debug!("C2 did not echo S1, continuing anyway");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handshake_completes_and_s2_echoes_c1() {
        let (mut client, mut server) = tokio::io::duplex(8192);
        let server_task = tokio::spawn(async move {
            perform_handshake(&mut server).await.map_err(|error| error.to_string())?;
            let mut after = [0_u8; 3];
            server.read_exact(&mut after).await.map_err(|error| error.to_string())?;
            Ok::<_, String>(after)
        });

        let c1: Vec<u8> = (0..PACKET_SIZE).map(|index| (index % 251) as u8).collect();
        client.write_u8(RTMP_VERSION).await.unwrap();
        client.write_all(&c1).await.unwrap();

        let mut response = vec![0_u8; 1 + PACKET_SIZE * 2];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(response[0], RTMP_VERSION, "Unexpected S0");
        assert_eq!(&response[1 + PACKET_SIZE..], &c1[..], "S2 should echo C1");

        let s1 = response[1..1 + PACKET_SIZE].to_vec();
        client.write_all(&s1).await.unwrap();
        client.write_all(&[1, 2, 3]).await.unwrap();

        let after = server_task.await.unwrap().unwrap();
        assert_eq!(after, [1, 2, 3], "Bytes after C2 should be left on the stream");
    }

    #[tokio::test]
    async fn wrong_version_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(8192);
        client.write_u8(6).await.unwrap();
        client.write_all(&[0_u8; PACKET_SIZE]).await.unwrap();

        assert!(perform_handshake(&mut server).await.is_err());
    }
}
