//! IP address management.
//!
//! Each subnet owns a bitmap with one bit per host address: bit `n` stands
//! for `network + 1 + n`, so bit 0 is the gateway. The table of bitmaps is
//! one JSON file shared by every engine invocation on the host; each
//! read-modify-write cycle runs under an exclusive `flock(2)` on a sibling
//! lock file so two concurrent allocations never see the same free bit.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use corral_common::error::{CorralError, Result};
use ipnetwork::Ipv4Network;
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};

/// Widest subnet the allocator tracks.
pub const MIN_PREFIX: u8 = 8;
/// Narrowest subnet that still has a gateway and one container address.
pub const MAX_PREFIX: u8 = 30;

const WORD_BITS: u32 = u64::BITS;

/// Fixed-size bit set over the host addresses of one subnet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bitmap {
    len: u32,
    words: Vec<u64>,
}

impl Bitmap {
    /// Creates an all-clear bitmap of `len` bits.
    #[must_use]
    pub fn new(len: u32) -> Self {
        Self {
            len,
            words: vec![0; len.div_ceil(WORD_BITS) as usize],
        }
    }

    /// Returns whether bit `n` is set. Out-of-range bits read as clear.
    #[must_use]
    pub fn get(&self, n: u32) -> bool {
        n < self.len && self.words[(n / WORD_BITS) as usize] & (1 << (n % WORD_BITS)) != 0
    }

    /// Sets or clears bit `n`. Out-of-range bits are ignored.
    pub fn set(&mut self, n: u32, value: bool) {
        if n >= self.len {
            return;
        }
        let word = &mut self.words[(n / WORD_BITS) as usize];
        if value {
            *word |= 1 << (n % WORD_BITS);
        } else {
            *word &= !(1 << (n % WORD_BITS));
        }
    }

    /// Returns the lowest clear bit.
    #[must_use]
    pub fn first_clear(&self) -> Option<u32> {
        self.words.iter().enumerate().find_map(|(i, word)| {
            if *word == u64::MAX {
                return None;
            }
            #[allow(clippy::cast_possible_truncation)]
            let n = i as u32 * WORD_BITS + word.trailing_ones();
            (n < self.len).then_some(n)
        })
    }

    /// Returns `true` when no bit is set.
    #[must_use]
    pub fn is_clear(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }
}

/// Number of assignable host addresses in a subnet (network and broadcast
/// excluded).
///
/// # Errors
///
/// Returns [`CorralError::NetworkConfig`] for prefixes outside
/// [`MIN_PREFIX`]..=[`MAX_PREFIX`].
pub fn host_count(subnet: &Ipv4Network) -> Result<u32> {
    let prefix = subnet.prefix();
    if !(MIN_PREFIX..=MAX_PREFIX).contains(&prefix) {
        return Err(CorralError::network(format!(
            "subnet {subnet} must have a prefix between /{MIN_PREFIX} and /{MAX_PREFIX}"
        )));
    }
    Ok((1u32 << (32 - u32::from(prefix))) - 2)
}

/// Persisted bitmaps keyed by subnet in CIDR notation.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationTable {
    subnets: BTreeMap<String, Bitmap>,
}

impl AllocationTable {
    /// Returns the bitmap of a subnet, if one has been recorded.
    #[must_use]
    pub fn bitmap(&self, subnet: &Ipv4Network) -> Option<&Bitmap> {
        self.subnets.get(&subnet_key(subnet))
    }
}

/// The address allocator.
#[derive(Debug, Clone)]
pub struct Ipam {
    state_file: PathBuf,
}

impl Ipam {
    /// Creates an allocator persisting its table to `state_file`.
    #[must_use]
    pub fn new(state_file: impl Into<PathBuf>) -> Self {
        Self {
            state_file: state_file.into(),
        }
    }

    /// Returns the path of the table file.
    #[must_use]
    pub fn state_file(&self) -> &Path {
        &self.state_file
    }

    /// Assigns the lowest free address of `subnet`.
    ///
    /// The first allocation in a fresh subnet returns its first host
    /// address, which the network manager reserves for the gateway.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::AllocationExhausted`] when every address is
    /// taken, [`CorralError::NetworkConfig`] for an unsupported prefix, or
    /// an I/O error if the table cannot be locked, read or written.
    pub fn allocate(&self, subnet: &Ipv4Network) -> Result<Ipv4Addr> {
        let subnet = normalize(subnet)?;
        let hosts = host_count(&subnet)?;
        self.update(|table| {
            let bitmap = table
                .subnets
                .entry(subnet_key(&subnet))
                .or_insert_with(|| Bitmap::new(hosts));
            let offset = bitmap
                .first_clear()
                .ok_or_else(|| CorralError::AllocationExhausted {
                    subnet: subnet.to_string(),
                })?;
            bitmap.set(offset, true);
            let ip = Ipv4Addr::from(u32::from(subnet.network()) + 1 + offset);
            tracing::debug!(subnet = %subnet, ip = %ip, "address allocated");
            Ok(ip)
        })
    }

    /// Returns `ip` to the pool of `subnet`.
    ///
    /// Releasing an address that is not allocated is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::NetworkConfig`] if `ip` lies outside the
    /// subnet, or an I/O error if the table cannot be locked, read or written.
    pub fn release(&self, subnet: &Ipv4Network, ip: Ipv4Addr) -> Result<()> {
        let subnet = normalize(subnet)?;
        if !subnet.contains(ip) {
            return Err(CorralError::network(format!(
                "address {ip} is not in subnet {subnet}"
            )));
        }
        self.update(|table| {
            let key = subnet_key(&subnet);
            let Some(bitmap) = table.subnets.get_mut(&key) else {
                return Ok(());
            };
            let distance = u32::from(ip) - u32::from(subnet.network());
            if let Some(offset) = distance.checked_sub(1) {
                bitmap.set(offset, false);
            }
            if bitmap.is_clear() {
                let _ = table.subnets.remove(&key);
            }
            tracing::debug!(subnet = %subnet, ip = %ip, "address released");
            Ok(())
        })
    }

    /// Returns whether `ip` is currently assigned in `subnet`.
    ///
    /// # Errors
    ///
    /// Returns an error if the table cannot be read.
    pub fn is_allocated(&self, subnet: &Ipv4Network, ip: Ipv4Addr) -> Result<bool> {
        let subnet = normalize(subnet)?;
        if !subnet.contains(ip) {
            return Ok(false);
        }
        let Some(offset) = (u32::from(ip) - u32::from(subnet.network())).checked_sub(1) else {
            return Ok(false);
        };
        let table = self.snapshot()?;
        Ok(table.bitmap(&subnet).is_some_and(|b| b.get(offset)))
    }

    /// Reads the current table under the lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the table cannot be locked or read.
    pub fn snapshot(&self) -> Result<AllocationTable> {
        let _lock = self.lock()?;
        self.load()
    }

    fn update<T>(&self, mutate: impl FnOnce(&mut AllocationTable) -> Result<T>) -> Result<T> {
        let _lock = self.lock()?;
        let mut table = self.load()?;
        let value = mutate(&mut table)?;
        self.save(&table)?;
        Ok(value)
    }

    fn lock(&self) -> Result<Flock<File>> {
        let dir = self.state_file.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir).map_err(|e| CorralError::io(dir, e))?;

        let lock_path = self.state_file.with_extension("lock");
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| CorralError::io(&lock_path, e))?;
        Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| CorralError::io(&lock_path, std::io::Error::from(errno)))
    }

    fn load(&self) -> Result<AllocationTable> {
        match std::fs::read(&self.state_file) {
            Ok(bytes) if bytes.is_empty() => Ok(AllocationTable::default()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AllocationTable::default()),
            Err(e) => Err(CorralError::io(&self.state_file, e)),
        }
    }

    fn save(&self, table: &AllocationTable) -> Result<()> {
        let tmp = self.state_file.with_extension("json.tmp");
        let bytes = serde_json::to_vec(table)?;
        std::fs::write(&tmp, bytes).map_err(|e| CorralError::io(&tmp, e))?;
        std::fs::rename(&tmp, &self.state_file).map_err(|e| CorralError::io(&self.state_file, e))
    }
}

fn normalize(subnet: &Ipv4Network) -> Result<Ipv4Network> {
    Ipv4Network::new(subnet.network(), subnet.prefix())
        .map_err(|e| CorralError::network(format!("invalid subnet {subnet}: {e}")))
}

fn subnet_key(subnet: &Ipv4Network) -> String {
    format!("{}/{}", subnet.network(), subnet.prefix())
}
