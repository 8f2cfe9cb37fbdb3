use std::io::SeekFrom;
use std::path::PathBuf;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::types::Xid;
use crate::{Error, Result};

use super::CHUNK_SIZE;

/// Slot stride inside a spill file: chunk payload plus an 8-byte
/// `{used u32, reserved u32}` prefix so a slot validates on its own.
const SLOT_SIZE: u64 = CHUNK_SIZE as u64 + 8;

/// Per-transaction spill files under `memory.swap-path`.
///
/// Each transaction owns one file named after its XID; chunk `idx` lives
/// at a fixed offset so chunks can be written and read back in any order.
pub struct SwapSpace {
    dir: PathBuf,
}

impl SwapSpace {
    pub fn new(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir).map_err(|e| {
            Error::runtime(10013, format!("swap path {} cannot be created: {e}", dir.display()))
        })?;
        Ok(SwapSpace { dir })
    }

    /// Removes leftover spill files from a previous run.
    pub fn cleanup(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "swap").unwrap_or(false) {
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!(path = %path.display(), "failed to remove stale swap file: {e}");
                } else {
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            debug!(removed, "removed stale swap files");
        }
        Ok(removed)
    }

    pub async fn write_chunk(&self, xid: Xid, idx: u32, data: &[u8]) -> Result<()> {
        debug_assert!(data.len() <= CHUNK_SIZE);
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(self.path_for(xid))
            .await?;
        file.seek(SeekFrom::Start(idx as u64 * SLOT_SIZE)).await?;
        file.write_all(&(data.len() as u32).to_le_bytes()).await?;
        file.write_all(&[0u8; 4]).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    /// Reads chunk `idx` back into `out`, returning the used byte count.
    pub async fn read_chunk(&self, xid: Xid, idx: u32, out: &mut [u8]) -> Result<usize> {
        let mut file = File::open(self.path_for(xid)).await.map_err(|e| {
            Error::runtime(10018, format!("swap file for {xid} cannot be opened: {e}"))
        })?;
        file.seek(SeekFrom::Start(idx as u64 * SLOT_SIZE)).await?;

        let mut prefix = [0u8; 8];
        file.read_exact(&mut prefix).await?;
        let used = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        if used > out.len() {
            return Err(Error::runtime(
                10018,
                format!("swap chunk {idx} of {xid} declares {used} bytes, chunk holds {}", out.len()),
            ));
        }
        file.read_exact(&mut out[..used]).await?;
        Ok(used)
    }

    /// Deletes the spill file at transaction end. Missing files are fine;
    /// most transactions never swap.
    pub async fn remove(&self, xid: Xid) {
        match tokio::fs::remove_file(self.path_for(xid)).await {
            Ok(()) => debug!(%xid, "removed swap file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(%xid, "failed to remove swap file: {e}"),
        }
    }

    fn path_for(&self, xid: Xid) -> PathBuf {
        self.dir.join(format!("{xid}.swap"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn chunk_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let swap = SwapSpace::new(tmp.path().to_path_buf()).unwrap();
        let xid = Xid::new(1, 2, 3);

        let data: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
        swap.write_chunk(xid, 0, &data).await.unwrap();
        swap.write_chunk(xid, 2, &data[..100]).await.unwrap();

        let mut out = vec![0u8; CHUNK_SIZE];
        let used = swap.read_chunk(xid, 0, &mut out).await.unwrap();
        assert_eq!(&out[..used], &data[..]);

        let used = swap.read_chunk(xid, 2, &mut out).await.unwrap();
        assert_eq!(used, 100);
        assert_eq!(&out[..100], &data[..100]);
    }

    #[tokio::test]
    async fn repeated_swap_cycles_are_stable() {
        let tmp = TempDir::new().unwrap();
        let swap = SwapSpace::new(tmp.path().to_path_buf()).unwrap();
        let xid = Xid::new(9, 0, 77);

        let mut data = vec![0xABu8; 4096];
        for round in 0..3 {
            data[0] = round;
            swap.write_chunk(xid, 1, &data).await.unwrap();
            let mut out = vec![0u8; CHUNK_SIZE];
            let used = swap.read_chunk(xid, 1, &mut out).await.unwrap();
            assert_eq!(&out[..used], &data[..]);
        }
    }

    #[tokio::test]
    async fn cleanup_removes_stale_files() {
        let tmp = TempDir::new().unwrap();
        let swap = SwapSpace::new(tmp.path().to_path_buf()).unwrap();
        swap.write_chunk(Xid::new(1, 1, 1), 0, b"x").await.unwrap();
        swap.write_chunk(Xid::new(2, 2, 2), 0, b"y").await.unwrap();
        assert_eq!(swap.cleanup().unwrap(), 2);
        assert_eq!(swap.cleanup().unwrap(), 0);
    }

    #[tokio::test]
    async fn remove_missing_file_is_silent() {
        let tmp = TempDir::new().unwrap();
        let swap = SwapSpace::new(tmp.path().to_path_buf()).unwrap();
        swap.remove(Xid::new(5, 5, 5)).await;
    }
}
