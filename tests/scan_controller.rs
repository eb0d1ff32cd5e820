//! End-to-end scans against the mock instruments.

use std::fs;
use std::path::{Path, PathBuf};

use seqe_daq::calibration::ReferenceDiode;
use seqe_daq::config::Settings;
use seqe_daq::error::DaqError;
use seqe_daq::instrument::mock::{MockFilterWheel, MockLockIn, MockMonochromator};
use seqe_daq::scan::{
    BandScan, Instruments, MeasurementController, ScanEvent, ScanRequest, ScanState,
};
use seqe_daq::storage::{self, ManifestEntry};
use tempfile::TempDir;

struct Rig {
    dir: TempDir,
    mono: MockMonochromator,
    lockin: MockLockIn,
    wheel: MockFilterWheel,
    controller: MeasurementController,
}

impl Rig {
    fn new(settings: Settings, mono: MockMonochromator) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let lockin = MockLockIn::new();
        let wheel = MockFilterWheel::new();
        let controller = MeasurementController::new(
            settings,
            dir.path(),
            Instruments::new(mono.clone(), lockin.clone(), wheel.clone()),
        )
        .unwrap();
        Self {
            dir,
            mono,
            lockin,
            wheel,
            controller,
        }
    }

    async fn connected(settings: Settings, mono: MockMonochromator) -> Self {
        let mut rig = Self::new(settings, mono);
        rig.controller.connect_all("dev2000").await.unwrap();
        rig
    }

    fn output_dir(&self) -> PathBuf {
        self.dir.path().join("alice").join("exp")
    }
}

fn settings() -> Settings {
    Settings::from_toml_str(
        r#"
[lockin]
time_constant_s = 0.01
"#,
    )
    .unwrap()
}

fn band(start: f64, stop: f64, step: f64) -> BandScan {
    BandScan {
        id: "main".into(),
        wheel_position: None,
        cuton_nm: None,
        start,
        stop,
        step,
        amplification: 1e6,
    }
}

fn request(bands: Vec<BandScan>) -> ScanRequest {
    ScanRequest {
        user: "alice".into(),
        experiment: "exp".into(),
        file_name: "scan".into(),
        reference: None,
        scan_speed: None,
        write_manifest: false,
        bands,
    }
}

fn wavelengths(path: &Path) -> Vec<f64> {
    storage::read_scan_file(path)
        .unwrap()
        .iter()
        .map(|r| r.wavelength)
        .collect()
}

#[tokio::test]
async fn single_band_writes_one_row_per_point_after_preroll() {
    let mut rig = Rig::connected(settings(), MockMonochromator::new().with_position(3, 1)).await;

    let report = rig
        .controller
        .run(&request(vec![band(400.0, 450.0, 10.0)]))
        .await
        .unwrap();

    assert_eq!(report.state, ScanState::Completed);
    assert_eq!(rig.controller.state(), ScanState::Completed);
    let path = &report.bands[0].path;
    assert_eq!(
        path,
        &rig.output_dir().join("scan_(400-450nm_10nm_1000000x).csv")
    );

    let rows = storage::read_scan_file(path).unwrap();
    assert_eq!(rows.len(), 6);
    assert_eq!(
        rows.iter().map(|r| r.wavelength).collect::<Vec<_>>(),
        vec![400.0, 410.0, 420.0, 430.0, 440.0, 450.0]
    );
    for row in &rows {
        assert!((row.mean_r - 2e-3).abs() < 1e-12);
        assert!((row.mean_current - 2e-9).abs() < 1e-18);
        assert_eq!(row.amplification, 1e6);
        assert_eq!(row.mean_frequency, 390.0);
        assert!(row.power.is_none());
    }
    assert_eq!(report.bands[0].plot.len(), 6);

    // Pre-roll point was moved to and measured, then dropped.
    assert!(rig.mono.call_log().contains(&"goto 390.00".to_string()));
    // Completed: both wheels back to open.
    assert_eq!(rig.wheel.current(), 1);
    assert_eq!(rig.mono.call_log().last().unwrap(), "select_filter 1");
    assert!(rig.lockin.subscriptions().is_empty());
    assert_eq!(rig.lockin.configured()[0].amplification, 1e6);
}

#[tokio::test]
async fn stop_halts_before_the_next_wavelength() {
    let mut rig = Rig::connected(settings(), MockMonochromator::new().with_position(3, 1)).await;
    // Poll 4 is the burst of 420 nm (390, 400, 410, 420).
    let _ = rig
        .lockin
        .clone()
        .stop_after_polls(4, rig.controller.stop_handle());

    let report = rig
        .controller
        .run(&request(vec![band(400.0, 490.0, 10.0)]))
        .await
        .unwrap();

    assert_eq!(report.state, ScanState::Cancelled);
    assert_eq!(rig.controller.state(), ScanState::Cancelled);
    assert_eq!(rig.mono.wavelength(), 420.0);
    assert_eq!(wavelengths(&report.bands[0].path), vec![400.0, 410.0, 420.0]);
    assert!(rig.lockin.subscriptions().is_empty());
    // No return to the open filter on a cancelled run.
    assert!(!rig.mono.call_log().contains(&"select_filter 1".to_string()));
}

#[tokio::test]
async fn stop_requested_during_connect_cancels_the_next_run() {
    let mut rig = Rig::connected(settings(), MockMonochromator::new().with_position(3, 1)).await;
    rig.controller.stop_handle().request();

    let report = rig
        .controller
        .run(&request(vec![band(400.0, 450.0, 10.0)]))
        .await
        .unwrap();

    assert_eq!(report.state, ScanState::Cancelled);
    assert!(report.bands.is_empty());
    assert!(rig.lockin.polls().is_empty());
    assert!(rig.wheel.call_log().is_empty());

    // The flag is cleared once the cancelled run has ended.
    let report = rig
        .controller
        .run(&request(vec![band(400.0, 410.0, 10.0)]))
        .await
        .unwrap();
    assert_eq!(report.state, ScanState::Completed);
    assert_eq!(report.rows(), 2);
}

#[tokio::test]
async fn transport_fault_keeps_written_rows() {
    let mut rig = Rig::connected(
        settings(),
        MockMonochromator::new()
            .with_position(3, 1)
            .fail_after_moves(3),
    )
    .await;

    let err = rig
        .controller
        .run(&request(vec![band(400.0, 490.0, 10.0)]))
        .await
        .unwrap_err();

    assert!(matches!(err, DaqError::Transport { ref device, .. } if device == "monochromator"));
    assert_eq!(rig.controller.state(), ScanState::Faulted);
    let path = rig
        .output_dir()
        .join("scan_(400-490nm_10nm_1000000x).csv");
    assert_eq!(wavelengths(&path), vec![400.0, 410.0]);
    assert!(rig.lockin.subscriptions().is_empty());
}

#[tokio::test]
async fn scan_is_refused_until_everything_is_connected() {
    let mut rig = Rig::new(settings(), MockMonochromator::new());
    rig.controller
        .instruments_mut()
        .monochromator
        .connect()
        .await
        .unwrap();

    let err = rig
        .controller
        .run(&request(vec![band(400.0, 450.0, 10.0)]))
        .await
        .unwrap_err();

    match err {
        DaqError::NotConnected { missing } => {
            assert_eq!(missing, vec!["lock-in".to_string(), "filter wheel".to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(rig.controller.state(), ScanState::Idle);
    assert!(!rig.output_dir().exists());
    assert!(rig.lockin.polls().is_empty());
}

#[tokio::test]
async fn grating_change_discards_one_settle_burst() {
    let mut rig = Rig::connected(settings(), MockMonochromator::new().with_position(3, 1)).await;
    let mut events = rig.controller.subscribe_events();

    // 530, 540, 550, 560: grating 1 -> 2 at 550 nm.
    let report = rig
        .controller
        .run(&request(vec![band(540.0, 560.0, 10.0)]))
        .await
        .unwrap();

    assert_eq!(wavelengths(&report.bands[0].path), vec![540.0, 550.0, 560.0]);
    assert_eq!(rig.lockin.polls().len(), 5);
    assert_eq!(rig.mono.grating(), 2);
    assert_eq!(
        rig.mono
            .call_log()
            .iter()
            .filter(|c| c.starts_with("select_grating"))
            .count(),
        1
    );

    let mut switched = 0;
    let mut rows = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            ScanEvent::Switched(_) => switched += 1,
            ScanEvent::Row(_) => rows += 1,
            _ => {}
        }
    }
    assert_eq!(switched, 1);
    assert_eq!(rows, 3);
}

#[tokio::test]
async fn reference_scan_adds_power_where_calibrated() {
    let calibration_dir = tempfile::tempdir().unwrap();
    let calibration = calibration_dir.path().join("si.csv");
    fs::write(
        &calibration,
        "Wavelength [nm],Responsivity [A/W]\n395,0.2\n425,0.5\n",
    )
    .unwrap();
    let mut settings = settings();
    settings.calibration.silicon = calibration;

    let mut rig = Rig::connected(settings, MockMonochromator::new().with_position(3, 1)).await;
    let mut request = request(vec![band(400.0, 430.0, 10.0)]);
    request.reference = Some(ReferenceDiode::Silicon);

    let report = rig.controller.run(&request).await.unwrap();
    assert_eq!(report.state, ScanState::Completed);

    let rows = storage::read_scan_file(&report.bands[0].path).unwrap();
    assert_eq!(rows.len(), 4);
    // 400 nm: responsivity 0.25 A/W.
    let power = rows[0].power.unwrap();
    assert!((power - 8e-9).abs() < 1e-15);
    // 430 nm lies outside the curve: row kept, power blank.
    assert_eq!(rows[3].wavelength, 430.0);
    assert!(rows[3].power.is_none());
}

#[tokio::test]
async fn composite_scan_moves_wheel_and_writes_manifest() {
    let mut rig = Rig::connected(settings(), MockMonochromator::new().with_position(3, 1)).await;
    let request = ScanRequest {
        write_manifest: true,
        bands: vec![
            BandScan {
                id: "f1".into(),
                wheel_position: Some(1),
                ..band(400.0, 420.0, 10.0)
            },
            BandScan {
                id: "f3".into(),
                wheel_position: Some(3),
                cuton_nm: Some(550.0),
                amplification: 1e7,
                ..band(600.0, 620.0, 10.0)
            },
        ],
        ..request(vec![])
    };

    let report = rig.controller.run(&request).await.unwrap();

    assert_eq!(report.state, ScanState::Completed);
    assert_eq!(report.bands.len(), 2);
    assert_eq!(
        report.bands[0].path,
        rig.output_dir()
            .join("scan_noFilter_(400-420nm_10nm_1000000x).csv")
    );
    assert_eq!(
        report.bands[1].path,
        rig.output_dir()
            .join("scan_550Filter_(600-620nm_10nm_10000000x).csv")
    );
    // The first point of every band is discarded.
    assert_eq!(wavelengths(&report.bands[0].path), vec![400.0, 410.0, 420.0]);
    assert_eq!(wavelengths(&report.bands[1].path), vec![600.0, 610.0, 620.0]);
    assert_eq!(
        rig.wheel.call_log(),
        vec!["set_position 1", "set_position 3", "set_position 1"]
    );

    let amplifications: Vec<f64> = rig
        .lockin
        .configured()
        .iter()
        .map(|p| p.amplification)
        .collect();
    assert_eq!(amplifications, vec![1e6, 1e7]);

    let manifest_path = report.manifest_path.unwrap();
    assert_eq!(manifest_path, rig.output_dir().join("scan_parameters.csv"));
    assert_eq!(
        storage::load_manifest(&manifest_path).unwrap(),
        vec![
            ManifestEntry {
                id: "f1".into(),
                start: 400.0,
                stop: 420.0,
                step: 10.0,
                amplification: 1e6,
            },
            ManifestEntry {
                id: "f3".into(),
                start: 600.0,
                stop: 620.0,
                step: 10.0,
                amplification: 1e7,
            },
        ]
    );
}

#[tokio::test]
async fn repeated_scan_does_not_overwrite_data() {
    let mut rig = Rig::connected(settings(), MockMonochromator::new().with_position(3, 1)).await;
    let request = request(vec![band(400.0, 410.0, 10.0)]);

    let first = rig.controller.run(&request).await.unwrap();
    let second = rig.controller.run(&request).await.unwrap();

    assert_eq!(
        first.bands[0].path,
        rig.output_dir().join("scan_(400-410nm_10nm_1000000x).csv")
    );
    assert_eq!(
        second.bands[0].path,
        rig.output_dir()
            .join("scan_(400-410nm_10nm_1000000x)_2.csv")
    );
    assert_eq!(wavelengths(&first.bands[0].path), vec![400.0, 410.0]);
    assert_eq!(wavelengths(&second.bands[0].path), vec![400.0, 410.0]);
}
