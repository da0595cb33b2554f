mod common;

use common::{fast_config, peak, Rig, SAMPLE_RATE};
use moodscape::render::Renderer;
use moodscape::{EngineConfig, MoodTable, OfflineSession};

fn pluck_book(occurrence: u32, minimum_presence: bool) -> String {
    format!(
        r#"
        [[moods]]
        key = "sparse"
        tempo = 120

        [[moods.modules]]
        id = "line"
        kind = "pluck"
        config = {{ volume = 100, occurrence = {occurrence}, intensity = 50 }}
        settings = {{ volume = 0.6, step = "1/8", patterns = ["C5 _ E5:0.5 _"], minimum_presence = {minimum_presence} }}
        "#
    )
}

fn render(book: &str, seconds: f64) -> Vec<f32> {
    let mut rig = Rig::new(book, fast_config());
    assert!(rig.orchestrator().set_playing(true, None));
    rig.session.render(seconds)
}

#[test]
fn minimum_presence_keeps_the_anchor_at_zero_occurrence() {
    let audio = render(&pluck_book(0, true), 2.0);
    assert!(peak(&audio) > 0.01);
}

#[test]
fn zero_occurrence_without_presence_is_silent() {
    let audio = render(&pluck_book(0, false), 2.0);
    assert!(peak(&audio) < 1e-6);
}

#[test]
fn module_at_zero_volume_is_silent() {
    let book = pluck_book(100, true).replace("volume = 100", "volume = 0");
    let audio = render(&book, 2.0);
    assert!(peak(&audio) < 1e-6);
}

#[test]
fn every_builtin_mood_plays_and_cleans_up() {
    let moods = MoodTable::builtin().unwrap();
    let keys: Vec<String> = moods.keys().map(str::to_string).collect();
    let mut session = OfflineSession::new(EngineConfig::default(), moods, SAMPLE_RATE);

    assert!(session.orchestrator_mut().set_playing(true, Some(&keys[0])));
    for key in &keys {
        assert!(session.orchestrator_mut().change_mood(key, false));
        let audio = session.render(6.0);
        assert!(audio.iter().all(|s| s.is_finite() && s.abs() <= 1.5), "{key} stays bounded");
        assert!(peak(&audio) > 1e-3, "{key} is audible");

        let state = session.orchestrator().debug_state();
        assert_eq!(state.current_mood.as_deref(), Some(key.as_str()));
        for module in &state.modules {
            assert!(module.voices <= 32, "{} holds {} voices", module.id, module.voices);
        }
        assert!(state.fatal_sources.is_empty());
    }

    assert!(session.orchestrator_mut().set_playing(false, None));
    session.advance(8.0);
    let state = session.orchestrator().debug_state();
    assert!(state.modules.iter().all(|m| m.voices == 0), "released voices are freed");
    assert!(state.retiring.is_empty());

    assert!(session.orchestrator_mut().dispose());
    assert_eq!(session.renderer().live_node_count(), 0);
}

#[test]
fn bounce_writes_a_wav() {
    let path = std::env::temp_dir().join(format!("moodscape-bounce-{}.wav", std::process::id()));
    let mut session = OfflineSession::new(EngineConfig::default(), MoodTable::builtin().unwrap(), SAMPLE_RATE);
    assert!(session.orchestrator_mut().set_playing(true, None));

    let frames = session.bounce(1.0, &path).unwrap();
    assert_eq!(frames, 8_000);
    let reader = hound::WavReader::open(&path).unwrap();
    assert_eq!(reader.duration(), 8_000);
    std::fs::remove_file(&path).ok();
}
