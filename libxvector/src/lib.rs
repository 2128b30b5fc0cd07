#![allow(non_snake_case)]

use std::ffi::CStr;
use std::os::raw::{c_char, c_int};
use std::path::Path;
use xvector_rs::{EmbeddingEngine, FbankFrontend, FeatureFrontend, OnnxEngine, SpeakerVerifier};

/// Opaque session handle. Empty until `InitModel` succeeds and again after
/// `Shutdown`. Calls on one handle must not overlap.
pub struct Verifier<E = OnnxEngine, F = FbankFrontend> {
    session: Option<SpeakerVerifier<E, F>>,
}

impl<E, F> Verifier<E, F> {
    fn new(session: Option<SpeakerVerifier<E, F>>) -> Self {
        Self { session }
    }
}

fn c_path<'a>(path: *const c_char) -> Option<&'a Path> {
    if path.is_null() {
        return None;
    }
    let c_str = unsafe { CStr::from_ptr(path) };
    c_str.to_str().ok().map(Path::new)
}

fn wave_bytes<'a>(wave_data: *const u8, length: usize) -> Option<&'a [u8]> {
    if wave_data.is_null() {
        return None;
    }
    Some(unsafe { std::slice::from_raw_parts(wave_data, length) })
}

/// Negative ids ask for a new speaker slot.
fn speaker_slot(speaker_id: c_int) -> usize {
    usize::try_from(speaker_id).unwrap_or(usize::MAX)
}

/// Runs `f` on the loaded session, logging failures and mapping them to
/// `fallback`.
fn with_session<E, F, T>(
    handle: *mut Verifier<E, F>,
    fallback: T,
    f: impl FnOnce(&mut SpeakerVerifier<E, F>) -> xvector_rs::Result<T>,
) -> T {
    if handle.is_null() {
        return fallback;
    }
    let verifier = unsafe { &mut *handle };
    let Some(session) = verifier.session.as_mut() else {
        tracing::error!("Speaker verification model is not initialized");
        return fallback;
    };
    match f(session) {
        Ok(value) => value,
        Err(error) => {
            tracing::error!("Speaker verification failed: {error}");
            fallback
        }
    }
}

fn feed_enroll_wave<E, F>(handle: *mut Verifier<E, F>, wave_data: *const u8, length: usize) -> bool
where
    E: EmbeddingEngine,
    F: FeatureFrontend,
{
    let Some(bytes) = wave_bytes(wave_data, length) else {
        return false;
    };
    with_session(handle, false, |session| {
        let samples = xvector_rs::pcm16_from_bytes(bytes)?;
        session.feed_enrolling_wave(&samples)?;
        Ok(true)
    })
}

fn feed_enroll_samples<E, F>(
    handle: *mut Verifier<E, F>,
    samples: *const i16,
    num_samples: usize,
) -> bool
where
    E: EmbeddingEngine,
    F: FeatureFrontend,
{
    if samples.is_null() {
        return false;
    }
    let samples = unsafe { std::slice::from_raw_parts(samples, num_samples) };
    with_session(handle, false, |session| {
        session.feed_enrolling_wave(samples)?;
        Ok(true)
    })
}

fn commit_enrollment<E, F>(handle: *mut Verifier<E, F>, speaker_id: c_int) -> bool
where
    E: EmbeddingEngine,
    F: FeatureFrontend,
{
    with_session(handle, false, |session| {
        session.commit_enrollment(speaker_slot(speaker_id))?;
        Ok(true)
    })
}

fn enroll_wave<E, F>(
    handle: *mut Verifier<E, F>,
    wave_data: *const u8,
    length: usize,
    speaker_id: c_int,
) -> c_int
where
    E: EmbeddingEngine,
    F: FeatureFrontend,
{
    let Some(bytes) = wave_bytes(wave_data, length) else {
        return -1;
    };
    with_session(handle, -1, |session| {
        let samples = xvector_rs::pcm16_from_bytes(bytes)?;
        let id = session.enroll_wave(&samples, speaker_slot(speaker_id))?;
        Ok(c_int::try_from(id).unwrap_or(-1))
    })
}

fn verify<E, F>(
    handle: *mut Verifier<E, F>,
    wave_data: *const u8,
    length: usize,
    accepted: *mut bool,
    score: *mut f32,
) -> bool
where
    E: EmbeddingEngine,
    F: FeatureFrontend,
{
    let Some(bytes) = wave_bytes(wave_data, length) else {
        return false;
    };
    let result = with_session(handle, None, |session| {
        let samples = xvector_rs::pcm16_from_bytes(bytes)?;
        session.verify_wave(&samples).map(Some)
    });
    let Some(result) = result else {
        return false;
    };
    unsafe {
        if !accepted.is_null() {
            *accepted = result.accepted;
        }
        if !score.is_null() {
            *score = result.score as f32;
        }
    }
    true
}

fn has_enrollment<E, F>(handle: *mut Verifier<E, F>) -> bool
where
    E: EmbeddingEngine,
    F: FeatureFrontend,
{
    with_session(handle, false, |session| Ok(session.has_enrollment()))
}

fn save_enrollment<E, F>(handle: *mut Verifier<E, F>) -> bool
where
    E: EmbeddingEngine,
    F: FeatureFrontend,
{
    with_session(handle, false, |session| {
        session.save_enrollment()?;
        Ok(true)
    })
}

fn load_enrollment<E, F>(handle: *mut Verifier<E, F>, path: *const c_char) -> bool
where
    E: EmbeddingEngine,
    F: FeatureFrontend,
{
    let Some(path) = c_path(path) else {
        return false;
    };
    with_session(handle, false, |session| {
        session.load_enrollment(path)?;
        Ok(true)
    })
}

fn shutdown<E, F>(handle: *mut Verifier<E, F>) -> bool {
    if handle.is_null() {
        return false;
    }
    let verifier = unsafe { &mut *handle };
    verifier.session = None;
    true
}

fn free_verifier<E, F>(handle: *mut Verifier<E, F>) {
    if !handle.is_null() {
        unsafe {
            let _ = Box::from_raw(handle);
        }
    }
}

#[no_mangle]
extern "C" fn CreateVerifier() -> *mut Verifier {
    Box::into_raw(Box::new(Verifier::new(None)))
}

#[no_mangle]
extern "C" fn InitModel(handle: *mut Verifier, model_dir: *const c_char) -> bool {
    if handle.is_null() {
        return false;
    }
    let Some(model_dir) = c_path(model_dir) else {
        return false;
    };
    let verifier = unsafe { &mut *handle };
    match SpeakerVerifier::from_model_dir(model_dir) {
        Ok(session) => {
            verifier.session = Some(session);
            true
        }
        Err(error) => {
            tracing::error!("Failed to initialize {}: {error}", model_dir.display());
            verifier.session = None;
            false
        }
    }
}

#[no_mangle]
extern "C" fn FeedEnrollWave(handle: *mut Verifier, wave_data: *const u8, length: usize) -> bool {
    feed_enroll_wave(handle, wave_data, length)
}

#[no_mangle]
extern "C" fn FeedEnrollSamples(
    handle: *mut Verifier,
    samples: *const i16,
    num_samples: usize,
) -> bool {
    feed_enroll_samples(handle, samples, num_samples)
}

#[no_mangle]
extern "C" fn CommitEnrollment(handle: *mut Verifier, speaker_id: c_int) -> bool {
    commit_enrollment(handle, speaker_id)
}

/// Returns the enrolled speaker id, or -1 on failure.
#[no_mangle]
extern "C" fn EnrollWave(
    handle: *mut Verifier,
    wave_data: *const u8,
    length: usize,
    speaker_id: c_int,
) -> c_int {
    enroll_wave(handle, wave_data, length, speaker_id)
}

/// Writes the decision and the score against speaker 0 on success. Returns
/// false when the utterance could not be scored, including when nobody is
/// enrolled; the outputs are then left untouched.
#[no_mangle]
extern "C" fn Verify(
    handle: *mut Verifier,
    wave_data: *const u8,
    length: usize,
    accepted: *mut bool,
    score: *mut f32,
) -> bool {
    verify(handle, wave_data, length, accepted, score)
}

#[no_mangle]
extern "C" fn HasEnrollment(handle: *mut Verifier) -> bool {
    has_enrollment(handle)
}

#[no_mangle]
extern "C" fn SaveEnrollment(handle: *mut Verifier) -> bool {
    save_enrollment(handle)
}

#[no_mangle]
extern "C" fn LoadEnrollment(handle: *mut Verifier, path: *const c_char) -> bool {
    load_enrollment(handle, path)
}

/// Drops the loaded model; the handle can be initialized again.
#[no_mangle]
extern "C" fn Shutdown(handle: *mut Verifier) -> bool {
    shutdown(handle)
}

#[no_mangle]
extern "C" fn FreeVerifier(handle: *mut Verifier) {
    free_verifier(handle)
}
