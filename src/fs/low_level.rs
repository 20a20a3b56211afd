//! Cluster I/O, superblock management and FAT-level file data access.
//!
//! This is the layer that knows the physical layout: page interleaving,
//! per-cluster encryption, the spare-area ECC/HMAC placement and the
//! 16-replica superblock ring. Everything above it works in terms of
//! whole 0x4000-byte clusters and FST indices.

use log::{debug, error, warn};

use crate::crypto::aes::{cbc_decrypt, cbc_encrypt};
use crate::crypto::hmac::{Digest, HmacSha1};
use crate::ecc;
use crate::fs::FileSystem;
use crate::sffs::{
    CLUSTER_COUNT, CLUSTER_DATA_SIZE, CLUSTER_LAST_IN_CHAIN, CLUSTER_UNUSED,
    CLUSTERS_PER_SUPERBLOCK, DATA_BYTES_PER_PAGE, ECC_OFFSET_IN_SPARE, FST_ENTRY_COUNT, FstEntry,
    HMAC_PAGE1, HMAC_PAGE2, HMAC1_OFFSET_IN_PAGE1, HMAC1_SIZE_IN_PAGE1, HMAC2_OFFSET_IN_PAGE1,
    HMAC2_OFFSET_IN_PAGE2, HMAC2_SIZE_IN_PAGE1, HMAC2_SIZE_IN_PAGE2, NUMBER_OF_SUPERBLOCKS,
    PAGES_PER_CLUSTER, SPARE_BYTES_PER_PAGE, SUPERBLOCK_MAGIC, SUPERBLOCK_START_CLUSTER,
    Superblock, data_salt, offset, superblock_cluster, superblock_salt,
};
use crate::utils::be_u32;
use crate::{Error, Result};

/// The data half of a cluster plus both stored HMAC copies.
pub(crate) struct ReadResult {
    pub data: Vec<u8>,
    pub hmac1: Digest,
    pub hmac2: Digest,
}

/// Walk a FAT chain `index` steps from `first_cluster`.
///
/// Returns `None` if the chain ends early (a sentinel value is reached
/// before `index` steps) or the final value is itself a sentinel.
pub(crate) fn cluster_for_file(
    superblock: &Superblock,
    first_cluster: u16,
    index: usize,
) -> Option<u16> {
    let mut cluster = first_cluster;
    for _ in 0..index {
        if cluster as usize >= superblock.fat.len() {
            warn!("cannot find cluster with index {index} in chain {first_cluster:#06x}");
            return None;
        }
        cluster = superblock.fat[cluster as usize];
    }
    if cluster as usize >= superblock.fat.len() {
        return None;
    }
    Some(cluster)
}

/// Resolve a path to an FST index. `/` and the empty path are the root.
pub(crate) fn fst_index(superblock: &Superblock, path: &str) -> Result<u16> {
    if path == "/" || path.is_empty() {
        return Ok(0);
    }

    let mut index = 0u16;
    for component in path[1..].split('/') {
        index = child_index(superblock, index, component)?;
    }
    Ok(index)
}

/// Find a child of `parent` by name, walking the `sub -> sib -> ...`
/// chain. Component names are compared byte-exact against the stored
/// name truncated at the first NUL.
pub(crate) fn child_index(superblock: &Superblock, parent: u16, file_name: &str) -> Result<u16> {
    if parent as usize >= FST_ENTRY_COUNT || file_name.len() > 12 {
        return Err(Error::Invalid);
    }

    let mut index = superblock.fst[parent as usize].sub;
    while (index as usize) < FST_ENTRY_COUNT {
        if superblock.fst[index as usize].name_bytes() == file_name.as_bytes() {
            return Ok(index);
        }
        index = superblock.fst[index as usize].sib;
    }
    Err(Error::Invalid)
}

/// Find the first free FST entry.
pub(crate) fn unused_fst_index(superblock: &Superblock) -> Result<u16> {
    superblock
        .fst
        .iter()
        .position(|entry| entry.mode & 3 == 0)
        .map(|index| index as u16)
        .ok_or(Error::FstFull)
}

impl FileSystem<'_> {
    pub(crate) fn generate_hmac_for_superblock(&self, bytes: &[u8], index: u32) -> Digest {
        let salt = superblock_salt(superblock_cluster(index));
        let mut mac = HmacSha1::new(&self.keys.hmac);
        mac.update(&salt);
        mac.update(bytes);
        mac.finalize()
    }

    /// `cluster_data` must be one full cluster (0x4000 bytes).
    pub(crate) fn generate_hmac_for_data(
        &self,
        entry: &FstEntry,
        cluster_data: &[u8],
        fst_index: u16,
        chain_index: u16,
    ) -> Digest {
        let salt = data_salt(entry, fst_index, chain_index);
        let mut mac = HmacSha1::new(&self.keys.hmac);
        mac.update(&salt);
        mac.update(cluster_data);
        mac.finalize()
    }

    /// Read one cluster's data half plus the two HMAC copies from its
    /// spare areas. Data clusters are decrypted; neither the ECC nor the
    /// HMAC is checked at this layer.
    pub(crate) fn read_cluster(&self, cluster: u16) -> Result<ReadResult> {
        if cluster as usize >= CLUSTER_COUNT {
            return Err(Error::Invalid);
        }

        debug!("reading cluster {cluster:#06x}");
        let mut data = Vec::with_capacity(CLUSTER_DATA_SIZE);
        for page in 0..PAGES_PER_CLUSTER {
            let off = offset(cluster as usize, page);
            data.extend_from_slice(&self.nand[off..off + DATA_BYTES_PER_PAGE]);
        }

        if cluster < SUPERBLOCK_START_CLUSTER {
            cbc_decrypt(&mut data, &self.keys.aes, &[0u8; 16]);
        }

        let spare1 = offset(cluster as usize, HMAC_PAGE1) + DATA_BYTES_PER_PAGE;
        let spare2 = offset(cluster as usize, HMAC_PAGE2) + DATA_BYTES_PER_PAGE;

        let mut hmac1 = [0u8; 20];
        hmac1.copy_from_slice(
            &self.nand
                [spare1 + HMAC1_OFFSET_IN_PAGE1..spare1 + HMAC1_OFFSET_IN_PAGE1 + HMAC1_SIZE_IN_PAGE1],
        );

        // The second copy straddles the spare areas of pages 6 and 7.
        let mut hmac2 = [0u8; 20];
        hmac2[..HMAC2_SIZE_IN_PAGE1].copy_from_slice(
            &self.nand
                [spare1 + HMAC2_OFFSET_IN_PAGE1..spare1 + HMAC2_OFFSET_IN_PAGE1 + HMAC2_SIZE_IN_PAGE1],
        );
        hmac2[HMAC2_SIZE_IN_PAGE1..].copy_from_slice(
            &self.nand
                [spare2 + HMAC2_OFFSET_IN_PAGE2..spare2 + HMAC2_OFFSET_IN_PAGE2 + HMAC2_SIZE_IN_PAGE2],
        );

        Ok(ReadResult { data, hmac1, hmac2 })
    }

    /// Write 0x4000 bytes of cluster data plus spare areas (ECC and the
    /// two HMAC copies). Data clusters are encrypted on the way out.
    pub(crate) fn write_cluster(&mut self, cluster: u16, data: &[u8], hmac: &Digest) -> Result<()> {
        if cluster as usize >= CLUSTER_COUNT {
            return Err(Error::Invalid);
        }
        debug_assert_eq!(data.len(), CLUSTER_DATA_SIZE);

        debug!("writing to cluster {cluster:#06x}");
        // CBC chains across the whole cluster; the on-NAND pages are just
        // consecutive slices of one 0x4000-byte ciphertext.
        let mut stored = data.to_vec();
        if cluster < SUPERBLOCK_START_CLUSTER {
            cbc_encrypt(&mut stored, &self.keys.aes, &[0u8; 16]);
        }

        for page in 0..PAGES_PER_CLUSTER {
            let source = &stored[page * DATA_BYTES_PER_PAGE..(page + 1) * DATA_BYTES_PER_PAGE];
            let dest = offset(cluster as usize, page);
            self.nand[dest..dest + DATA_BYTES_PER_PAGE].copy_from_slice(source);

            let mut spare = [0u8; SPARE_BYTES_PER_PAGE];
            spare[0] = 0xFF; // not a bad block
            let ecc = ecc::calculate(source);
            spare[ECC_OFFSET_IN_SPARE..ECC_OFFSET_IN_SPARE + 16].copy_from_slice(&ecc);

            if page == HMAC_PAGE1 {
                spare[HMAC1_OFFSET_IN_PAGE1..HMAC1_OFFSET_IN_PAGE1 + HMAC1_SIZE_IN_PAGE1]
                    .copy_from_slice(hmac);
                // Start of the second, partial copy of the HMAC.
                spare[HMAC2_OFFSET_IN_PAGE1..HMAC2_OFFSET_IN_PAGE1 + HMAC2_SIZE_IN_PAGE1]
                    .copy_from_slice(&hmac[..HMAC2_SIZE_IN_PAGE1]);
            } else if page == HMAC_PAGE2 {
                // Rest of the second copy.
                spare[HMAC2_OFFSET_IN_PAGE2..HMAC2_OFFSET_IN_PAGE2 + HMAC2_SIZE_IN_PAGE2]
                    .copy_from_slice(&hmac[HMAC2_SIZE_IN_PAGE1..]);
            }

            self.nand[dest + DATA_BYTES_PER_PAGE..dest + DATA_BYTES_PER_PAGE + SPARE_BYTES_PER_PAGE]
                .copy_from_slice(&spare);
        }

        Ok(())
    }

    /// Read the 16 constituent clusters of superblock replica `index`
    /// into one contiguous 0x40000-byte buffer.
    fn read_superblock_bytes(&self, index: u32) -> Result<Vec<u8>> {
        debug!("reading superblock {index}");
        let mut bytes = Vec::with_capacity(CLUSTERS_PER_SUPERBLOCK as usize * CLUSTER_DATA_SIZE);
        for i in 0..CLUSTERS_PER_SUPERBLOCK {
            let result = self.read_cluster(superblock_cluster(index) + i as u16)?;
            bytes.extend_from_slice(&result.data);
        }
        Ok(bytes)
    }

    /// Make sure a verified superblock is loaded.
    ///
    /// On first use this scans all 16 replicas, keeps the one with the
    /// highest version whose magic matches, and verifies its HMAC (stored
    /// in the replica's 15th cluster) before caching it. An unverifiable
    /// winner is not cached.
    pub(crate) fn ensure_superblock(&mut self) -> Result<()> {
        if self.superblock.is_some() {
            return Ok(());
        }

        let mut highest_version = 0u32;
        let mut best: Option<(u32, Vec<u8>)> = None;
        for index in 0..NUMBER_OF_SUPERBLOCKS {
            let bytes = self.read_superblock_bytes(index)?;
            if bytes[0..4] != SUPERBLOCK_MAGIC {
                continue;
            }

            let version = be_u32(&bytes, 4);
            if best.is_some() && version < highest_version {
                debug!("found an older superblock: index {index}, version {version}");
                continue;
            }

            debug!("found a newer superblock: index {index}, version {version}");
            highest_version = version;
            best = Some((index, bytes));
        }

        let Some((index, bytes)) = best else {
            return Err(Error::SuperblockInitFailed);
        };

        let hash = self.generate_hmac_for_superblock(&bytes, index);
        let stored = self.read_cluster(superblock_cluster(index) + 15)?;
        if hash != stored.hmac1 && hash != stored.hmac2 {
            error!("failed to verify superblock");
            return Err(Error::SuperblockInitFailed);
        }

        let superblock = Superblock::parse(&bytes).map_err(|_| Error::SuperblockInitFailed)?;
        self.superblock_index = index;
        self.superblock = Some(Box::new(superblock));
        Ok(())
    }

    /// Write a new superblock version to persist metadata changes.
    ///
    /// The version is incremented once, then up to 16 replica slots are
    /// tried, advancing the ring index each attempt.
    pub(crate) fn flush_superblock(&mut self) -> Result<()> {
        let Some(superblock) = self.superblock.as_mut() else {
            return Err(Error::NotFound);
        };

        superblock.version = superblock.version.wrapping_add(1);
        let version = superblock.version;
        let bytes = superblock.serialize();

        for _ in 0..NUMBER_OF_SUPERBLOCKS {
            match self.write_superblock(&bytes, version) {
                Ok(()) => return Ok(()),
                Err(_) => warn!(
                    "failed to write superblock at index {}",
                    self.superblock_index
                ),
            }
        }
        error!("failed to flush superblock");
        Err(Error::SuperblockWriteFailed)
    }

    fn write_superblock(&mut self, bytes: &[u8], version: u32) -> Result<()> {
        self.superblock_index = (self.superblock_index + 1) % NUMBER_OF_SUPERBLOCKS;
        let hmac = self.generate_hmac_for_superblock(bytes, self.superblock_index);
        let null_hmac: Digest = [0u8; 20];

        for cluster in 0..CLUSTERS_PER_SUPERBLOCK {
            let off = cluster as usize * CLUSTER_DATA_SIZE;
            // Only the last cluster of a replica carries the real HMAC.
            let spare_hmac = if cluster == 15 { &hmac } else { &null_hmac };
            self.write_cluster(
                superblock_cluster(self.superblock_index) + cluster as u16,
                &bytes[off..off + CLUSTER_DATA_SIZE],
                spare_hmac,
            )?;
        }

        // According to WiiQt/nandbin, 15 other versions should be written
        // after an overflow so that the driver doesn't pick an older
        // superblock.
        if version == 0 {
            debug!("superblock version overflowed, writing 15 extra versions");
            for _ in 0..15 {
                self.flush_superblock()?;
            }
        }

        debug!(
            "flushed superblock (index {}, version {version})",
            self.superblock_index
        );
        Ok(())
    }

    /// Read and verify one cluster of a file's data.
    pub(crate) fn read_file_data(&mut self, fst_index: u16, chain_index: u16) -> Result<Vec<u8>> {
        if fst_index as usize >= FST_ENTRY_COUNT {
            return Err(Error::Invalid);
        }

        self.ensure_superblock()?;
        let superblock = self.superblock.as_ref().ok_or(Error::SuperblockInitFailed)?;

        let entry = superblock.fst[fst_index as usize];
        if !entry.is_file() || entry.size <= u32::from(chain_index) * CLUSTER_DATA_SIZE as u32 {
            return Err(Error::Invalid);
        }

        let cluster =
            cluster_for_file(superblock, entry.sub, chain_index as usize).ok_or(Error::Invalid)?;
        let result = self.read_cluster(cluster)?;

        let hash = self.generate_hmac_for_data(&entry, &result.data, fst_index, chain_index);
        if hash != result.hmac1 && hash != result.hmac2 {
            error!("failed to verify cluster data (fst_index {fst_index:#06x} chain_index {chain_index})");
            return Err(Error::CheckFailed);
        }

        Ok(result.data)
    }

    /// Write one cluster of a file's data to a freshly allocated cluster
    /// and splice it into the chain, freeing the cluster it replaces.
    ///
    /// Writing to a new cluster first keeps the old chain intact until
    /// the superblock is flushed, so a failed write never corrupts the
    /// currently persisted file.
    pub(crate) fn write_file_data(
        &mut self,
        fst_index: u16,
        data: &[u8],
        chain_index: u16,
        new_size: u32,
    ) -> Result<()> {
        debug!("writing to file {fst_index:#06x} chain_index {chain_index}");
        if fst_index as usize >= FST_ENTRY_COUNT {
            return Err(Error::Invalid);
        }

        self.ensure_superblock()?;
        let superblock = self.superblock.as_ref().ok_or(Error::SuperblockInitFailed)?;

        let entry = superblock.fst[fst_index as usize];
        // Files never shrink; rewriting without growing is rejected too.
        if !entry.is_file() || new_size <= entry.size {
            return Err(Error::Invalid);
        }

        // First-fit allocation. Wear leveling is deliberately absent:
        // the backing store is an in-memory image, and external test
        // suites depend on deterministic cluster indices.
        let cluster = superblock
            .fat
            .iter()
            .position(|&c| c == CLUSTER_UNUSED)
            .ok_or(Error::NoFreeSpace)? as u16;
        debug!("found free cluster {cluster:#06x}");

        let hash = self.generate_hmac_for_data(&entry, data, fst_index, chain_index);
        self.write_cluster(cluster, data, &hash)?;

        let superblock = self.superblock.as_mut().ok_or(Error::SuperblockInitFailed)?;
        let old_cluster = cluster_for_file(superblock, entry.sub, chain_index as usize);

        // Point the previous cluster (or the FST) at the new cluster.
        if chain_index == 0 {
            superblock.fst[fst_index as usize].sub = cluster;
        } else {
            let previous = cluster_for_file(superblock, entry.sub, chain_index as usize - 1)
                .ok_or(Error::Invalid)?;
            superblock.fat[previous as usize] = cluster;
        }

        // If we are replacing another cluster, keep pointing at the same
        // next cluster.
        superblock.fat[cluster as usize] = match old_cluster {
            Some(old) => superblock.fat[old as usize],
            None => CLUSTER_LAST_IN_CHAIN,
        };

        if let Some(old) = old_cluster {
            debug!("freeing cluster {old:#06x}");
            superblock.fat[old as usize] = CLUSTER_UNUSED;
        }

        superblock.fst[fst_index as usize].size = new_size;
        Ok(())
    }
}
