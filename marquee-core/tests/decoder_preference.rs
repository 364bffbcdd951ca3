//! The process-wide decoder preference. Kept in its own test binary since it
//! mutates global state.

use std::sync::Arc;

use marquee_core::{
    current_decoder, decoder_list, set_current_decoder, FsResolver, MediaKind, MediaSession,
    MemorySurface, SyntheticSpec, UniversalBackend, SOFTWARE_DECODER,
};

#[test]
fn test_preference_applies_to_later_opens_only() {
    let dir = tempfile::tempdir().unwrap();
    let spec = SyntheticSpec {
        audio: false,
        duration_ms: 300,
        ..SyntheticSpec::default()
    };
    std::fs::write(dir.path().join("clip.synth"), serde_json::to_vec(&spec).unwrap()).unwrap();
    let archive = dir.path().to_str().unwrap();
    let backend = Arc::new(UniversalBackend::default());

    assert!(decoder_list(backend.as_ref()).contains(&"emulated-hw".to_string()));
    assert_eq!(current_decoder(), SOFTWARE_DECODER);

    let mut first = MediaSession::new(MediaKind::Video, backend.clone());
    first
        .open(&FsResolver::new(), archive, "clip.synth", Some(Box::new(MemorySurface::native())))
        .unwrap();

    set_current_decoder("emulated-hw");
    let mut second = MediaSession::new(MediaKind::Video, backend.clone());
    second
        .open(&FsResolver::new(), archive, "clip.synth", Some(Box::new(MemorySurface::native())))
        .unwrap();

    assert_eq!(first.video_decoder().as_deref(), Some(SOFTWARE_DECODER));
    assert_eq!(second.video_decoder().as_deref(), Some("emulated-hw"));

    // Unknown names fall back to software instead of failing the open
    set_current_decoder("quantum-accelerator");
    let mut third = MediaSession::new(MediaKind::Video, backend);
    third
        .open(&FsResolver::new(), archive, "clip.synth", None)
        .unwrap();
    assert_eq!(third.video_decoder().as_deref(), Some(SOFTWARE_DECODER));

    set_current_decoder("");
    assert_eq!(current_decoder(), SOFTWARE_DECODER);
}
