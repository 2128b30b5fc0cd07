use crate::error::{Error, Result};
use crate::plda::Plda;
use crate::tagged::{TaggedReader, TaggedWriter};
use ndarray::{Array1, ArrayView1};
use std::io::{BufRead, Write};
use std::path::Path;

const COUNT_OPEN: &str = "<num_enrolled_features>";
const COUNT_CLOSE: &str = "</num_enrolled_features>";
const VECTORS_OPEN: &str = "<enrolled_features>";
const VECTORS_CLOSE: &str = "</enrolled_features>";
const UTTS_OPEN: &str = "<num_utts>";
const UTTS_CLOSE: &str = "</num_utts>";

/// One enrolled speaker: the PLDA-space average of its utterances.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeakerTemplate {
    pub xvector: Array1<f64>,
    pub num_utts: usize,
}

/// Enrolled speakers; the index in the store is the speaker id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnrollmentStore {
    speakers: Vec<SpeakerTemplate>,
}

impl EnrollmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.speakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.speakers.is_empty()
    }

    pub fn get(&self, speaker_id: usize) -> Option<&SpeakerTemplate> {
        self.speakers.get(speaker_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SpeakerTemplate> {
        self.speakers.iter()
    }

    /// Dimension of the stored templates, `None` when empty.
    pub fn dim(&self) -> Option<usize> {
        self.speakers.first().map(|s| s.xvector.len())
    }

    /// Overwrites the template of an existing `speaker_id`, or appends a new
    /// speaker when the id is out of range. Returns the id that was written.
    pub fn enroll(&mut self, xvector: Array1<f64>, num_utts: usize, speaker_id: usize) -> usize {
        let template = SpeakerTemplate { xvector, num_utts };
        if speaker_id < self.speakers.len() {
            self.speakers[speaker_id] = template;
            speaker_id
        } else {
            self.speakers.push(template);
            self.speakers.len() - 1
        }
    }

    pub fn clear(&mut self) {
        self.speakers.clear();
    }

    /// Log-likelihood ratio of `probe` against every speaker, in id order.
    /// An empty store gives an empty vector, which is not a decision.
    pub fn score(&self, plda: &Plda, probe: ArrayView1<f64>) -> Vec<f64> {
        self.speakers
            .iter()
            .map(|speaker| {
                plda.log_likelihood_ratio(speaker.xvector.view(), speaker.num_utts, probe)
            })
            .collect()
    }

    pub fn read<R: BufRead>(reader: &mut TaggedReader<R>) -> Result<Self> {
        reader.expect_token(COUNT_OPEN)?;
        let count = reader.read_i32()?;
        let count = usize::try_from(count)
            .map_err(|_| Error::Format(format!("negative speaker count {count}")))?;
        reader.expect_token(COUNT_CLOSE)?;

        reader.expect_token(VECTORS_OPEN)?;
        let mut xvectors = Vec::with_capacity(count);
        for _ in 0..count {
            xvectors.push(reader.read_vector::<f64>()?);
        }
        reader.expect_token(VECTORS_CLOSE)?;

        reader.expect_token(UTTS_OPEN)?;
        let mut speakers = Vec::with_capacity(count);
        for xvector in xvectors {
            let num_utts = reader.read_i32()?;
            let num_utts = usize::try_from(num_utts)
                .map_err(|_| Error::Format(format!("negative utterance count {num_utts}")))?;
            speakers.push(SpeakerTemplate { xvector, num_utts });
        }
        reader.expect_token(UTTS_CLOSE)?;

        let store = Self { speakers };
        if let Some(dim) = store.dim() {
            if store.iter().any(|s| s.xvector.len() != dim) {
                return Err(Error::Format("enrolled templates differ in dimension".into()));
            }
        }
        Ok(store)
    }

    pub fn write<W: Write>(&self, writer: &mut TaggedWriter<W>) -> Result<()> {
        let count = i32::try_from(self.len())
            .map_err(|_| Error::InvalidArgument("too many enrolled speakers".into()))?;
        writer.write_token(COUNT_OPEN)?;
        writer.write_i32(count)?;
        writer.write_token(COUNT_CLOSE)?;

        writer.write_token(VECTORS_OPEN)?;
        for speaker in &self.speakers {
            writer.write_vector(speaker.xvector.view())?;
        }
        writer.write_token(VECTORS_CLOSE)?;

        writer.write_token(UTTS_OPEN)?;
        for speaker in &self.speakers {
            let num_utts = i32::try_from(speaker.num_utts)
                .map_err(|_| Error::InvalidArgument("utterance count overflows i32".into()))?;
            writer.write_i32(num_utts)?;
        }
        writer.write_token(UTTS_CLOSE)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut reader = crate::tagged::open(path)?;
        Self::read(&mut reader)
    }

    /// Replaces the file at `path`. An interrupted save leaves the previous
    /// file intact.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        crate::tagged::replace(path, true, |writer| self.write(writer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};
    use std::io::Cursor;

    fn round_trip(store: &EnrollmentStore, binary: bool) -> EnrollmentStore {
        let mut writer = TaggedWriter::new(Vec::new(), binary).unwrap();
        store.write(&mut writer).unwrap();
        let bytes = writer.into_inner();
        let mut reader = TaggedReader::new(Cursor::new(bytes)).unwrap();
        EnrollmentStore::read(&mut reader).unwrap()
    }

    #[test]
    fn enroll_appends_then_overwrites() {
        let mut store = EnrollmentStore::new();
        assert_eq!(store.enroll(array![1.0, 0.0], 1, 0), 0);
        assert_eq!(store.len(), 1);

        // An id past the end is appended at the next free slot.
        assert_eq!(store.enroll(array![0.0, 1.0], 2, 7), 1);
        assert_eq!(store.len(), 2);

        assert_eq!(store.enroll(array![5.0, 5.0], 3, 0), 0);
        assert_eq!(store.len(), 2);
        assert_eq!(store.get(0).unwrap().xvector, array![5.0, 5.0]);
        assert_eq!(store.get(0).unwrap().num_utts, 3);
        assert_eq!(store.get(1).unwrap().num_utts, 2);
    }

    #[test]
    fn empty_store_scores_nothing() {
        let plda = Plda::new(array![0.0], Array2::eye(1), array![1.0]).unwrap();
        assert!(EnrollmentStore::new().score(&plda, array![1.0].view()).is_empty());
    }

    #[test]
    fn scores_follow_store_order() {
        let plda = Plda::new(array![0.0, 0.0], Array2::eye(2), array![4.0, 1.0]).unwrap();
        let mut store = EnrollmentStore::new();
        store.enroll(array![-2.0, 0.0], 1, 0);
        store.enroll(array![2.0, 0.0], 1, 1);
        let probe = array![2.0, 0.0];
        let scores = store.score(&plda, probe.view());
        assert_eq!(scores.len(), 2);
        assert!(scores[1] > scores[0]);
        assert_eq!(scores[1], plda.log_likelihood_ratio(array![2.0, 0.0].view(), 1, probe.view()));
    }

    #[test]
    fn empty_store_round_trips() {
        for binary in [true, false] {
            let read = round_trip(&EnrollmentStore::new(), binary);
            assert!(read.is_empty());
        }
    }

    #[test]
    fn templates_round_trip() {
        let mut store = EnrollmentStore::new();
        store.enroll(array![0.25, -1.5, 3.0], 4, 0);
        store.enroll(array![1.0 / 3.0, 0.0, -7.125], 1, 1);
        store.enroll(array![9.0, 8.0, 7.0], 12, 2);
        for binary in [true, false] {
            assert_eq!(round_trip(&store, binary), store);
        }
    }

    #[test]
    fn sections_are_tagged_in_order() {
        let mut store = EnrollmentStore::new();
        store.enroll(array![1.0], 3, 0);
        let mut writer = TaggedWriter::new(Vec::new(), false).unwrap();
        store.write(&mut writer).unwrap();
        let text = String::from_utf8(writer.into_inner()).unwrap();
        let words: Vec<&str> = text.split_whitespace().collect();
        assert_eq!(
            words,
            [
                "<num_enrolled_features>",
                "1",
                "</num_enrolled_features>",
                "<enrolled_features>",
                "[",
                "1",
                "]",
                "</enrolled_features>",
                "<num_utts>",
                "3",
                "</num_utts>"
            ]
        );
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("enroll.xvector");
        let mut store = EnrollmentStore::new();
        store.enroll(array![0.5, 0.5], 2, 0);
        store.save(&path).unwrap();
        assert_eq!(EnrollmentStore::load(&path).unwrap(), store);
    }

    #[test]
    fn truncated_file_is_rejected() {
        let text = b"<num_enrolled_features> 2 </num_enrolled_features> \
            <enrolled_features> [ 1 ]\n</enrolled_features> ";
        let mut reader = TaggedReader::new(Cursor::new(&text[..])).unwrap();
        assert!(EnrollmentStore::read(&mut reader).is_err());
    }
}
