//! Kernel map handles.
//!
//! [`Map`] owns the FD and speaks raw bytes; [`TypedMap`] layers a
//! [`MapCodec`] on top so callers work with their own key/value types.
//! ENOENT from the kernel is absence, not failure: `lookup` answers
//! `None`, `delete` answers `false`.

use std::marker::PhantomData;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use bitflags::bitflags;

use crate::consts::MapType;
use crate::error::{Error, Result};
use crate::progs::Program;
use crate::sys;

bitflags! {
    /// Flags for `update`: `BPF_ANY` is the empty set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UpdateFlags: u64 {
        const NO_EXIST = 1;
        const EXIST = 2;
        const LOCK = 4;
    }
}

impl UpdateFlags {
    pub const ANY: UpdateFlags = UpdateFlags::empty();
}

/// The ABI shape of a map to create.
#[derive(Debug, Clone)]
pub struct MapSpec {
    pub map_type: MapType,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    pub flags: u32,
    pub name: Option<String>,
    /// BTF type id of the value for struct_ops maps; the kernel derives
    /// the value size from it.
    pub btf_vmlinux_value_type_id: u32,
}

impl MapSpec {
    pub fn new(map_type: MapType, key_size: u32, value_size: u32, max_entries: u32) -> Self {
        MapSpec {
            map_type,
            key_size,
            value_size,
            max_entries,
            flags: 0,
            name: None,
            btf_vmlinux_value_type_id: 0,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Per-type invariants the kernel would reject anyway, caught here
    /// with a readable message.
    fn validate(&self) -> Result<()> {
        match self.map_type {
            MapType::Ringbuf => {
                if self.key_size != 0 || self.value_size != 0 {
                    return Err(Error::shape(
                        "ring-buffer maps carry no keys or values; sizes must be 0",
                    ));
                }
                sys::validate_ringbuf_size(self.max_entries)
            }
            MapType::ProgArray => {
                if self.key_size != 4 || self.value_size != 4 {
                    return Err(Error::shape("prog_array maps are u32 -> u32 (4/4)"));
                }
                Ok(())
            }
            MapType::StructOps => {
                if self.btf_vmlinux_value_type_id == 0 {
                    return Err(Error::shape(
                        "struct_ops maps need btf_vmlinux_value_type_id",
                    ));
                }
                Ok(())
            }
            _ => {
                if self.key_size == 0 || self.value_size == 0 {
                    return Err(Error::shape(format!(
                        "{:?} maps need non-zero key and value sizes",
                        self.map_type
                    )));
                }
                Ok(())
            }
        }
    }
}

/// An owned kernel map. The FD closes on drop.
pub struct Map {
    fd: OwnedFd,
    spec: MapSpec,
}

impl Map {
    pub fn create(spec: MapSpec) -> Result<Self> {
        spec.validate()?;
        let fd = sys::map_create(&sys::MapCreateArgs {
            map_type: u32::from(spec.map_type),
            key_size: spec.key_size,
            value_size: spec.value_size,
            max_entries: spec.max_entries,
            map_flags: spec.flags,
            name: spec.name.as_deref(),
            btf_vmlinux_value_type_id: spec.btf_vmlinux_value_type_id,
            ..Default::default()
        })?;
        log::debug!(
            "created {:?} map {:?}: key {}B value {}B x{}",
            spec.map_type,
            spec.name.as_deref().unwrap_or("<anon>"),
            spec.key_size,
            spec.value_size,
            spec.max_entries
        );
        Ok(Map { fd, spec })
    }

    /// Adopt a pinned map. The bpffs node does not expose the shape, so
    /// the caller restates it.
    pub fn open_pinned(path: &str, spec: MapSpec) -> Result<Self> {
        spec.validate()?;
        let fd = sys::obj_get(path)?;
        Ok(Map { fd, spec })
    }

    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn map_type(&self) -> MapType {
        self.spec.map_type
    }

    pub fn key_size(&self) -> u32 {
        self.spec.key_size
    }

    pub fn value_size(&self) -> u32 {
        self.spec.value_size
    }

    pub fn max_entries(&self) -> u32 {
        self.spec.max_entries
    }

    pub fn name(&self) -> Option<&str> {
        self.spec.name.as_deref()
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() != self.spec.key_size as usize {
            return Err(Error::shape(format!(
                "key is {} bytes, map wants {}",
                key.len(),
                self.spec.key_size
            )));
        }
        Ok(())
    }

    fn check_value(&self, value: &[u8]) -> Result<()> {
        if value.len() != self.spec.value_size as usize {
            return Err(Error::shape(format!(
                "value is {} bytes, map wants {}",
                value.len(),
                self.spec.value_size
            )));
        }
        Ok(())
    }

    pub fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_key(key)?;
        let mut value = vec![0u8; self.spec.value_size as usize];
        match sys::map_lookup_elem(self.fd(), key, &mut value) {
            Ok(()) => Ok(Some(value)),
            Err(e) if e.is_enoent() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn update(&self, key: &[u8], value: &[u8], flags: UpdateFlags) -> Result<()> {
        self.check_key(key)?;
        self.check_value(value)?;
        sys::map_update_elem(self.fd(), key, value, flags.bits())
    }

    /// Returns whether the key was present.
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        self.check_key(key)?;
        match sys::map_delete_elem(self.fd(), key) {
            Ok(()) => Ok(true),
            Err(e) if e.is_enoent() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Pop semantics for queue/stack maps, read-and-clear elsewhere.
    pub fn lookup_and_delete(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_key(key)?;
        let mut value = vec![0u8; self.spec.value_size as usize];
        match sys::map_lookup_and_delete_elem(self.fd(), key, &mut value) {
            Ok(()) => Ok(Some(value)),
            Err(e) if e.is_enoent() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// `prev = None` fetches the first key; ENOENT ends iteration.
    pub fn next_key(&self, prev: Option<&[u8]>) -> Result<Option<Vec<u8>>> {
        if let Some(p) = prev {
            self.check_key(p)?;
        }
        let mut next = vec![0u8; self.spec.key_size as usize];
        if sys::map_get_next_key(self.fd(), prev, &mut next)? {
            Ok(Some(next))
        } else {
            Ok(None)
        }
    }

    /// Iterate keys in kernel order. Keys inserted or removed by
    /// concurrent writers may be missed or repeated; each step is only
    /// atomic on its own.
    pub fn keys(&self) -> Keys<'_> {
        Keys {
            map: self,
            prev: None,
            done: false,
        }
    }

    /// Iterate (key, value) pairs via next_key + lookup. Entries that
    /// vanish between the two steps are skipped.
    pub fn entries(&self) -> Entries<'_> {
        Entries { keys: self.keys() }
    }

    /// Contiguous batch update. Returns the number of elements the
    /// kernel processed. Kernels without batch support for the map type
    /// answer EINVAL; that downgrades to a per-element loop.
    pub fn update_batch(&self, keys: &[u8], values: &[u8], flags: UpdateFlags) -> Result<u32> {
        let count = self.batch_count(keys, values.len())?;
        match sys::map_update_batch(self.fd(), keys, values, count, flags.bits()) {
            Ok(n) => Ok(n),
            Err(e) if e.is_einval() => {
                let downgrade = Error::Unsupported {
                    feature: format!("batch update for {:?} maps", self.spec.map_type),
                    kernel: crate::progs::kernel_release(),
                };
                log::warn!("{downgrade}; falling back to per-element updates");
                let ksz = self.spec.key_size as usize;
                let vsz = self.spec.value_size as usize;
                for i in 0..count as usize {
                    self.update(
                        &keys[i * ksz..(i + 1) * ksz],
                        &values[i * vsz..(i + 1) * vsz],
                        flags,
                    )?;
                }
                Ok(count)
            }
            Err(e) => Err(e),
        }
    }

    pub fn delete_batch(&self, keys: &[u8]) -> Result<u32> {
        let count = self.key_batch_count(keys)?;
        match sys::map_delete_batch(self.fd(), keys, count, 0) {
            Ok(n) => Ok(n),
            Err(e) if e.is_einval() => {
                let downgrade = Error::Unsupported {
                    feature: format!("batch delete for {:?} maps", self.spec.map_type),
                    kernel: crate::progs::kernel_release(),
                };
                log::warn!("{downgrade}; falling back to per-element deletes");
                let ksz = self.spec.key_size as usize;
                for i in 0..count as usize {
                    self.delete(&keys[i * ksz..(i + 1) * ksz])?;
                }
                Ok(count)
            }
            Err(e) => Err(e),
        }
    }

    /// Read up to `count` entries in one call. Returns flat key and
    /// value arrays truncated to what the kernel delivered.
    pub fn lookup_batch(&self, count: u32) -> Result<(Vec<u8>, Vec<u8>, u32)> {
        let ksz = self.spec.key_size as usize;
        let vsz = self.spec.value_size as usize;
        let mut keys = vec![0u8; ksz * count as usize];
        let mut values = vec![0u8; vsz * count as usize];
        match sys::map_lookup_batch(self.fd(), &mut keys, &mut values, count, 0) {
            Ok(n) => {
                keys.truncate(ksz * n as usize);
                values.truncate(vsz * n as usize);
                Ok((keys, values, n))
            }
            Err(e) if e.is_einval() => {
                let downgrade = Error::Unsupported {
                    feature: format!("batch lookup for {:?} maps", self.spec.map_type),
                    kernel: crate::progs::kernel_release(),
                };
                log::warn!("{downgrade}; falling back to iteration");
                keys.clear();
                values.clear();
                let mut n = 0;
                for entry in self.entries().take(count as usize) {
                    let (k, v) = entry?;
                    keys.extend_from_slice(&k);
                    values.extend_from_slice(&v);
                    n += 1;
                }
                Ok((keys, values, n))
            }
            Err(e) => Err(e),
        }
    }

    pub fn freeze(&self) -> Result<()> {
        sys::map_freeze(self.fd())
    }

    pub fn pin(&self, path: &str) -> Result<()> {
        sys::obj_pin(path, self.fd())
    }

    pub fn unpin(&self, path: &str) -> Result<()> {
        std::fs::remove_file(path)?;
        Ok(())
    }

    fn batch_count(&self, keys: &[u8], values_len: usize) -> Result<u32> {
        let count = self.key_batch_count(keys)?;
        if values_len != count as usize * self.spec.value_size as usize {
            return Err(Error::shape(format!(
                "batch values are {} bytes for {} keys of {}-byte values",
                values_len, count, self.spec.value_size
            )));
        }
        Ok(count)
    }

    fn key_batch_count(&self, keys: &[u8]) -> Result<u32> {
        let ksz = self.spec.key_size as usize;
        if ksz == 0 || keys.len() % ksz != 0 {
            return Err(Error::shape(format!(
                "batch keys ({} bytes) are not a whole number of {}-byte keys",
                keys.len(),
                ksz
            )));
        }
        Ok((keys.len() / ksz) as u32)
    }
}

pub struct Keys<'a> {
    map: &'a Map,
    prev: Option<Vec<u8>>,
    done: bool,
}

impl Iterator for Keys<'_> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.map.next_key(self.prev.as_deref()) {
            Ok(Some(key)) => {
                self.prev = Some(key.clone());
                Some(Ok(key))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

pub struct Entries<'a> {
    keys: Keys<'a>,
}

impl Iterator for Entries<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let key = match self.keys.next()? {
                Ok(k) => k,
                Err(e) => return Some(Err(e)),
            };
            match self.keys.map.lookup(&key) {
                Ok(Some(value)) => return Some(Ok((key, value))),
                // deleted between next_key and lookup; skip it
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// The four codec hooks a typed map needs.
pub trait MapCodec {
    type Key;
    type Value;

    fn serialize_key(&self, key: &Self::Key) -> Vec<u8>;
    fn deserialize_key(&self, bytes: &[u8]) -> Result<Self::Key>;
    fn serialize_value(&self, value: &Self::Value) -> Vec<u8>;
    fn deserialize_value(&self, bytes: &[u8]) -> Result<Self::Value>;
}

/// Fixed-size little-endian plain-old-data, the common case for
/// counters and id-keyed tables.
pub trait Pod: Sized + Copy {
    const SIZE: usize;
    fn to_bytes(&self) -> Vec<u8>;
    fn from_bytes(bytes: &[u8]) -> Result<Self>;
}

macro_rules! pod_int {
    ($($ty:ty),+) => {
        $(impl Pod for $ty {
            const SIZE: usize = std::mem::size_of::<$ty>();

            fn to_bytes(&self) -> Vec<u8> {
                self.to_le_bytes().to_vec()
            }

            fn from_bytes(bytes: &[u8]) -> Result<Self> {
                let arr = bytes.try_into().map_err(|_| {
                    Error::shape(format!(
                        "expected {} bytes for {}, got {}",
                        Self::SIZE,
                        stringify!($ty),
                        bytes.len()
                    ))
                })?;
                Ok(<$ty>::from_le_bytes(arr))
            }
        })+
    };
}

pod_int!(u8, u16, u32, u64, i8, i16, i32, i64);

impl<const N: usize> Pod for [u8; N] {
    const SIZE: usize = N;

    fn to_bytes(&self) -> Vec<u8> {
        self.to_vec()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bytes
            .try_into()
            .map_err(|_| Error::shape(format!("expected {N} bytes, got {}", bytes.len())))
    }
}

/// Codec over two [`Pod`] types.
pub struct PodCodec<K, V>(PhantomData<(K, V)>);

impl<K, V> Default for PodCodec<K, V> {
    fn default() -> Self {
        PodCodec(PhantomData)
    }
}

impl<K: Pod, V: Pod> MapCodec for PodCodec<K, V> {
    type Key = K;
    type Value = V;

    fn serialize_key(&self, key: &K) -> Vec<u8> {
        key.to_bytes()
    }

    fn deserialize_key(&self, bytes: &[u8]) -> Result<K> {
        K::from_bytes(bytes)
    }

    fn serialize_value(&self, value: &V) -> Vec<u8> {
        value.to_bytes()
    }

    fn deserialize_value(&self, bytes: &[u8]) -> Result<V> {
        V::from_bytes(bytes)
    }
}

/// A [`Map`] plus a codec: callers speak K and V.
pub struct TypedMap<C: MapCodec> {
    map: Map,
    codec: C,
}

impl<C: MapCodec> TypedMap<C> {
    pub fn new(map: Map, codec: C) -> Self {
        TypedMap { map, codec }
    }

    pub fn raw(&self) -> &Map {
        &self.map
    }

    pub fn lookup(&self, key: &C::Key) -> Result<Option<C::Value>> {
        let key = self.codec.serialize_key(key);
        match self.map.lookup(&key)? {
            Some(bytes) => Ok(Some(self.codec.deserialize_value(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn update(&self, key: &C::Key, value: &C::Value, flags: UpdateFlags) -> Result<()> {
        let key = self.codec.serialize_key(key);
        let value = self.codec.serialize_value(value);
        self.map.update(&key, &value, flags)
    }

    pub fn delete(&self, key: &C::Key) -> Result<bool> {
        let key = self.codec.serialize_key(key);
        self.map.delete(&key)
    }

    pub fn lookup_and_delete(&self, key: &C::Key) -> Result<Option<C::Value>> {
        let key = self.codec.serialize_key(key);
        match self.map.lookup_and_delete(&key)? {
            Some(bytes) => Ok(Some(self.codec.deserialize_value(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Decoded (key, value) pairs in kernel iteration order.
    pub fn entries(&self) -> impl Iterator<Item = Result<(C::Key, C::Value)>> + '_ {
        self.map.entries().map(move |entry| {
            let (k, v) = entry?;
            Ok((
                self.codec.deserialize_key(&k)?,
                self.codec.deserialize_value(&v)?,
            ))
        })
    }
}

impl<K: Pod, V: Pod> TypedMap<PodCodec<K, V>> {
    /// Create a hash-style map shaped after the pod types.
    pub fn create_pod(map_type: MapType, max_entries: u32, name: Option<&str>) -> Result<Self> {
        let mut spec = MapSpec::new(map_type, K::SIZE as u32, V::SIZE as u32, max_entries);
        if let Some(n) = name {
            spec = spec.named(n);
        }
        Ok(TypedMap::new(Map::create(spec)?, PodCodec::default()))
    }
}

/// A prog_array plus the programs parked in it. The entry program sits
/// at index 0; unset slots make the in-kernel `tail_call` helper fall
/// through. Closing the chain drops the programs before the table.
pub struct TailCallChain {
    programs: Vec<(u32, Program)>,
    table: Map,
}

impl TailCallChain {
    pub fn create(name: Option<&str>, max_entries: u32) -> Result<Self> {
        let mut spec = MapSpec::new(MapType::ProgArray, 4, 4, max_entries);
        if let Some(n) = name {
            spec = spec.named(n);
        }
        Ok(TailCallChain {
            programs: Vec::new(),
            table: Map::create(spec)?,
        })
    }

    /// The underlying prog_array, for `ld_map_fd` in caller bytecode.
    pub fn table(&self) -> &Map {
        &self.table
    }

    /// Park `program` at `index`, replacing any previous occupant.
    pub fn set(&mut self, index: u32, program: Program) -> Result<()> {
        let fd = program.fd() as u32;
        self.table
            .update(&index.to_le_bytes(), &fd.to_le_bytes(), UpdateFlags::ANY)?;
        self.programs.retain(|(i, _)| *i != index);
        self.programs.push((index, program));
        Ok(())
    }

    /// Clear a slot; the parked program is dropped.
    pub fn unset(&mut self, index: u32) -> Result<bool> {
        let was_set = self.table.delete(&index.to_le_bytes())?;
        self.programs.retain(|(i, _)| *i != index);
        Ok(was_set)
    }

    pub fn entry(&self) -> Option<&Program> {
        self.program(0)
    }

    pub fn program(&self, index: u32) -> Option<&Program> {
        self.programs
            .iter()
            .find(|(i, _)| *i == index)
            .map(|(_, p)| p)
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ringbuf_spec_rules() {
        let spec = MapSpec::new(MapType::Ringbuf, 0, 0, 4096 * 4);
        assert!(spec.validate().is_ok());

        let bad = MapSpec::new(MapType::Ringbuf, 4, 4, 4096 * 4);
        assert!(bad.validate().is_err());

        let bad = MapSpec::new(MapType::Ringbuf, 0, 0, 12345);
        assert!(bad.validate().is_err());
    }

    #[test]
    fn prog_array_spec_rules() {
        assert!(MapSpec::new(MapType::ProgArray, 4, 4, 16).validate().is_ok());
        assert!(MapSpec::new(MapType::ProgArray, 8, 4, 16)
            .validate()
            .is_err());
    }

    #[test]
    fn hash_maps_need_real_sizes() {
        assert!(MapSpec::new(MapType::Hash, 0, 8, 16).validate().is_err());
        assert!(MapSpec::new(MapType::Hash, 4, 0, 16).validate().is_err());
        assert!(MapSpec::new(MapType::Hash, 4, 8, 16).validate().is_ok());
    }

    #[test]
    fn pod_roundtrip() {
        let codec = PodCodec::<u32, u64>::default();
        let key_bytes = codec.serialize_key(&0xdeadbeef);
        assert_eq!(key_bytes, 0xdeadbeefu32.to_le_bytes());
        assert_eq!(codec.deserialize_key(&key_bytes).unwrap(), 0xdeadbeef);
        assert!(codec.deserialize_key(&[0u8; 3]).is_err());

        let arr: [u8; 6] = *b"abcdef";
        assert_eq!(<[u8; 6]>::from_bytes(&arr.to_bytes()).unwrap(), arr);
    }

    #[test]
    fn update_flags_values() {
        assert_eq!(UpdateFlags::ANY.bits(), 0);
        assert_eq!(UpdateFlags::NO_EXIST.bits(), 1);
        assert_eq!(UpdateFlags::EXIST.bits(), 2);
        assert_eq!(UpdateFlags::LOCK.bits(), 4);
    }
}
