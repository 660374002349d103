//! Purpose: Sorted spill segments for the index builder and the k-way merge over them.
//! Exports: `write_segment`, `write_group`, `SegmentReader`, `Run`, `Merger`, `MergedGroup`.
//! Role: External-sort stage between the bounded accumulator and the final index.
//! Invariants: A segment is a run of (digest, u32 count, locations) groups in ascending digest order.
//! Invariants: Merging holds at most one group header per run; locations stream run to writer.
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::collections::btree_map;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::core::digest::Digest;
use crate::core::error::{Error, ErrorKind};
use crate::core::format::{LOCATION_SIZE, Location, read_u32};

pub type Group = (Digest, Vec<Location>);

pub fn write_segment<I>(path: &Path, groups: I) -> Result<u64, Error>
where
    I: IntoIterator<Item = Group>,
{
    let file = File::create(path).map_err(|err| resource(path, "create spill segment", err))?;
    let mut writer = BufWriter::new(file);
    let mut written = 0u64;
    for (digest, locations) in groups {
        write_group(&mut writer, &digest, &locations)
            .map_err(|err| resource(path, "write spill segment", err))?;
        written += 1;
    }
    writer
        .flush()
        .map_err(|err| resource(path, "flush spill segment", err))?;
    Ok(written)
}

/// Writes one group in the shared segment/index entry layout.
pub fn write_group<W: Write>(
    writer: &mut W,
    digest: &Digest,
    locations: &[Location],
) -> io::Result<()> {
    writer.write_all(digest.as_bytes())?;
    writer.write_all(&(locations.len() as u32).to_le_bytes())?;
    write_locations(writer, locations)
}

fn write_locations<W: Write>(writer: &mut W, locations: &[Location]) -> io::Result<()> {
    for location in locations {
        writer.write_all(&location.encode())?;
    }
    Ok(())
}

pub struct SegmentReader {
    path: PathBuf,
    reader: BufReader<File>,
    digest_len: usize,
}

impl SegmentReader {
    pub fn open(path: &Path, digest_len: usize) -> Result<Self, Error> {
        let file = File::open(path).map_err(|err| resource(path, "open spill segment", err))?;
        Ok(Self {
            path: path.to_path_buf(),
            reader: BufReader::new(file),
            digest_len,
        })
    }

    /// Reads the next group's digest and location count, leaving its locations unread.
    pub fn next_head(&mut self) -> Result<Option<(Digest, u32)>, Error> {
        let at_end = self
            .reader
            .fill_buf()
            .map_err(|err| resource(&self.path, "read spill segment", err))?
            .is_empty();
        if at_end {
            return Ok(None);
        }
        let mut digest = vec![0u8; self.digest_len];
        let mut count = [0u8; 4];
        self.reader
            .read_exact(&mut digest)
            .and_then(|_| self.reader.read_exact(&mut count))
            .map_err(|err| resource(&self.path, "read spill segment", err))?;
        Ok(Some((Digest::from_bytes(&digest), read_u32(&count, 0))))
    }

    /// Copies the current group's `count` locations to `writer` without decoding them.
    fn copy_locations<W: Write>(&mut self, count: u32, writer: &mut W) -> Result<(), Error> {
        let expected = count as u64 * LOCATION_SIZE as u64;
        let copied = io::copy(&mut (&mut self.reader).take(expected), writer)
            .map_err(|err| resource(&self.path, "copy spill segment", err))?;
        if copied != expected {
            return Err(Error::new(ErrorKind::Resource)
                .with_message("spill segment ended inside a group")
                .with_path(&self.path));
        }
        Ok(())
    }
}

/// One sorted input to the merge.
pub enum Run {
    Segment(SegmentReader),
    Memory(btree_map::IntoIter<Digest, Vec<Location>>),
}

/// Unwritten locations of a run's current group.
enum Pending {
    Segment(u32),
    Memory(Vec<Location>),
}

impl Pending {
    fn count(&self) -> u64 {
        match self {
            Pending::Segment(count) => *count as u64,
            Pending::Memory(locations) => locations.len() as u64,
        }
    }
}

impl Run {
    fn next_head(&mut self) -> Result<Option<(Digest, Pending)>, Error> {
        match self {
            Run::Segment(reader) => Ok(reader
                .next_head()?
                .map(|(digest, count)| (digest, Pending::Segment(count)))),
            Run::Memory(iter) => Ok(iter
                .next()
                .map(|(digest, locations)| (digest, Pending::Memory(locations)))),
        }
    }
}

/// Digest and total location count of one group written by `Merger::write_next`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MergedGroup {
    pub digest: Digest,
    pub count: u32,
}

/// Merges runs into one ascending, fully grouped sequence.
/// Equal digests concatenate in run order, so runs must be given in encode order.
pub struct Merger {
    runs: Vec<Run>,
    heads: Vec<Option<Pending>>,
    heap: BinaryHeap<Reverse<(Digest, usize)>>,
}

impl Merger {
    pub fn new(runs: Vec<Run>) -> Result<Self, Error> {
        let mut merger = Self {
            heads: runs.iter().map(|_| None).collect(),
            runs,
            heap: BinaryHeap::new(),
        };
        for index in 0..merger.runs.len() {
            merger.advance(index)?;
        }
        Ok(merger)
    }

    fn advance(&mut self, index: usize) -> Result<(), Error> {
        if let Some((digest, pending)) = self.runs[index].next_head()? {
            self.heads[index] = Some(pending);
            self.heap.push(Reverse((digest, index)));
        }
        Ok(())
    }

    /// Writes the next merged group to `writer`; write failures are reported against `path`.
    pub fn write_next<W: Write>(
        &mut self,
        writer: &mut W,
        path: &Path,
    ) -> Result<Option<MergedGroup>, Error> {
        let Some(Reverse((digest, first))) = self.heap.pop() else {
            return Ok(None);
        };
        // Heap order is (digest, run), so members come out in run order.
        let mut members = vec![first];
        while self
            .heap
            .peek()
            .is_some_and(|Reverse((next, _))| *next == digest)
        {
            if let Some(Reverse((_, index))) = self.heap.pop() {
                members.push(index);
            }
        }

        let total: u64 = members
            .iter()
            .map(|index| self.heads[*index].as_ref().map_or(0, Pending::count))
            .sum();
        let count = u32::try_from(total).map_err(|_| {
            Error::new(ErrorKind::Resource)
                .with_message(format!("{total} cells share one value; the index limit is {}", u32::MAX))
        })?;
        writer
            .write_all(digest.as_bytes())
            .and_then(|_| writer.write_all(&count.to_le_bytes()))
            .map_err(|err| resource(path, "write index entry", err))?;

        for index in members {
            match self.heads[index].take() {
                Some(Pending::Segment(count)) => {
                    let Run::Segment(reader) = &mut self.runs[index] else {
                        return Err(Error::new(ErrorKind::Internal)
                            .with_message("segment head on a memory run"));
                    };
                    reader.copy_locations(count, writer)?;
                }
                Some(Pending::Memory(locations)) => write_locations(writer, &locations)
                    .map_err(|err| resource(path, "write index entry", err))?,
                None => {}
            }
            self.advance(index)?;
        }
        Ok(Some(MergedGroup { digest, count }))
    }
}

fn resource(path: &Path, action: &str, err: io::Error) -> Error {
    Error::new(ErrorKind::Resource)
        .with_message(format!("failed to {action}"))
        .with_path(path)
        .with_source(err)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::Path;

    use super::{MergedGroup, Merger, Run, SegmentReader, write_group, write_segment};
    use crate::core::digest::Digest;
    use crate::core::format::Location;

    fn digest(byte: u8) -> Digest {
        Digest::from_bytes(&[byte, byte])
    }

    fn run_map(groups: &[(u8, Location)]) -> BTreeMap<Digest, Vec<Location>> {
        let mut map: BTreeMap<Digest, Vec<Location>> = BTreeMap::new();
        for (byte, location) in groups {
            map.entry(digest(*byte)).or_default().push(*location);
        }
        map
    }

    fn merge_all(runs: Vec<Run>) -> (Vec<MergedGroup>, Vec<u8>) {
        let mut merger = Merger::new(runs).expect("merger");
        let mut out = Vec::new();
        let mut groups = Vec::new();
        while let Some(group) = merger
            .write_next(&mut out, Path::new("index"))
            .expect("merge")
        {
            groups.push(group);
        }
        (groups, out)
    }

    fn expected_bytes(groups: &[(Digest, Vec<Location>)]) -> Vec<u8> {
        let mut out = Vec::new();
        for (digest, locations) in groups {
            write_group(&mut out, digest, locations).expect("write");
        }
        out
    }

    #[test]
    fn segment_heads_read_back_what_was_written() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("seg-0");
        let map = run_map(&[
            (3, Location::new(0, 0, 0)),
            (1, Location::new(0, 1, 0)),
            (1, Location::new(0, 1, 1)),
        ]);
        let written = write_segment(&path, map.clone()).expect("write");
        assert_eq!(written, 2);

        let reader = SegmentReader::open(&path, 2).expect("open");
        let (groups, bytes) = merge_all(vec![Run::Segment(reader)]);
        assert_eq!(
            groups,
            vec![
                MergedGroup { digest: digest(1), count: 2 },
                MergedGroup { digest: digest(3), count: 1 },
            ]
        );
        assert_eq!(bytes, expected_bytes(&map.into_iter().collect::<Vec<_>>()));
    }

    #[test]
    fn merge_groups_equal_digests_in_run_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = dir.path().join("seg-0");
        write_segment(
            &first,
            run_map(&[(5, Location::new(0, 0, 0)), (2, Location::new(0, 1, 0))]),
        )
        .expect("write first");
        let second = dir.path().join("seg-1");
        write_segment(
            &second,
            run_map(&[(5, Location::new(0, 0, 1)), (9, Location::new(0, 1, 1))]),
        )
        .expect("write second");
        let memory = run_map(&[(2, Location::new(1, 0, 0)), (5, Location::new(1, 0, 1))]);

        let runs = vec![
            Run::Segment(SegmentReader::open(&first, 2).expect("open")),
            Run::Segment(SegmentReader::open(&second, 2).expect("open")),
            Run::Memory(memory.into_iter()),
        ];
        let (groups, bytes) = merge_all(runs);

        assert_eq!(
            groups.iter().map(|group| group.count).collect::<Vec<_>>(),
            vec![2, 3, 1]
        );
        assert_eq!(
            bytes,
            expected_bytes(&[
                (digest(2), vec![Location::new(0, 1, 0), Location::new(1, 0, 0)]),
                (
                    digest(5),
                    vec![
                        Location::new(0, 0, 0),
                        Location::new(0, 0, 1),
                        Location::new(1, 0, 1)
                    ]
                ),
                (digest(9), vec![Location::new(0, 1, 1)]),
            ])
        );
    }

    #[test]
    fn truncated_segment_is_a_resource_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("seg-0");
        write_segment(&path, run_map(&[(7, Location::new(0, 0, 0))])).expect("write");
        let bytes = std::fs::read(&path).expect("read");
        std::fs::write(&path, &bytes[..bytes.len() - 4]).expect("truncate");

        let reader = SegmentReader::open(&path, 2).expect("open");
        let mut merger = Merger::new(vec![Run::Segment(reader)]).expect("merger");
        let err = merger
            .write_next(&mut Vec::new(), Path::new("index"))
            .expect_err("truncated");
        assert_eq!(err.kind(), crate::core::error::ErrorKind::Resource);
    }
}
