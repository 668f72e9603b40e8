/*!
 * Application lifecycle tests through the controller
 */

use std::sync::Arc;

use namesake::app_config::Config;
use namesake::app_controller::Controller;
use namesake::database::models::JobKind;
use namesake::database::Repository;
use namesake::errors::AppError;
use namesake::providers::mock::MockProvider;
use namesake::providers::ProviderRegistry;

use crate::common::{create_temp_dir, create_test_file, init_test_logger, story_provider};

fn controller(provider: MockProvider) -> Controller {
    init_test_logger();
    let mut config = Config::default();
    config.pipeline.min_request_interval_ms = 0;
    config.pipeline.worker_count = 1;
    let providers = Arc::new(ProviderRegistry::new().with_provider("mock", Arc::new(provider)));
    Controller::with_components(config, Repository::new_in_memory().unwrap(), providers)
}

/// Import, extract, translate and rebuild a small work
#[tokio::test]
async fn test_controller_importAndProcess_shouldTranslateWork() {
    let dir = create_temp_dir().unwrap();
    create_test_file(dir.path(), "001.txt", "李伟拜入天元宗。").unwrap();
    create_test_file(dir.path(), "002.md", "王芳开始筑基。").unwrap();
    create_test_file(dir.path(), "notes.json", "{}").unwrap();
    let controller = controller(story_provider());

    let summary = controller
        .import_directory(dir.path(), Some("天元传"), "zh", &["en".to_string()])
        .await
        .unwrap();
    assert_eq!(summary.chapters, 2);
    assert_eq!(summary.jobs, 2);

    let chapters = controller.repository().list_source_chapters(summary.work_id).await.unwrap();
    assert_eq!(chapters[0].title, "001");
    assert_eq!(chapters[1].number, 2);

    assert_eq!(controller.process(10).await.unwrap().succeeded, 2);
    assert_eq!(controller.process(10).await.unwrap().succeeded, 2);

    let translated = controller
        .repository()
        .get_chapter_in_language(chapters[1].slot_id, "en")
        .await
        .unwrap()
        .unwrap();
    assert!(translated.content.contains("Wang Fang"));

    let rebuilt = controller.rebuild(Some(summary.work_id), true).await.unwrap();
    assert_eq!(rebuilt[0].1.writes(), 0);
    assert!(rebuilt[0].1.keywords.unwrap() >= 4);

    let stats = controller.job_stats().await.unwrap();
    assert_eq!(stats.done, 4);
    let db_stats = controller.database_stats().unwrap();
    assert_eq!(db_stats.work_count, 1);
    assert_eq!(db_stats.entity_count, 4);
}

/// Translations can be queued for a new language after import
#[tokio::test]
async fn test_controller_enqueueTranslation_shouldCountNewJobsOnly() {
    let dir = create_temp_dir().unwrap();
    create_test_file(dir.path(), "01.txt", "李伟。").unwrap();
    let controller = controller(story_provider());
    let summary = controller.import_directory(dir.path(), None, "zh", &[]).await.unwrap();

    let work = controller.repository().get_work(summary.work_id).await.unwrap().unwrap();
    assert_eq!(work.title, dir.path().file_name().unwrap().to_string_lossy());

    let created = controller
        .enqueue(summary.work_id, JobKind::Translation, &["fr".to_string()])
        .await
        .unwrap();
    assert_eq!(created, 1);
    let again = controller
        .enqueue(summary.work_id, JobKind::Translation, &["fr".to_string()])
        .await
        .unwrap();
    assert_eq!(again, 0);
    assert_eq!(
        controller.enqueue(summary.work_id, JobKind::Extraction, &[]).await.unwrap(),
        0
    );
}

/// Directories without chapter files are rejected
#[tokio::test]
async fn test_controller_importEmptyDirectory_shouldFail() {
    let dir = create_temp_dir().unwrap();
    create_test_file(dir.path(), "cover.png", "not text").unwrap();
    let controller = controller(story_provider());

    assert!(controller.import_directory(dir.path(), None, "zh", &[]).await.is_err());
    assert!(controller
        .import_directory(&dir.path().join("missing"), None, "zh", &[])
        .await
        .is_err());
}

/// Provider checks report unknown names and unreachable backends
#[tokio::test]
async fn test_controller_checkProvider_shouldReportFailures() {
    let failing = controller(MockProvider::failing());
    let healthy = controller(story_provider());

    assert!(matches!(
        failing.check_provider(Some("nope")).await,
        Err(AppError::Provider(_))
    ));
    assert!(failing.check_provider(None).await.is_err());
    assert!(healthy.check_provider(Some("mock")).await.is_ok());
}

/// Invalid configuration never reaches the database
#[test]
fn test_controller_fromConfig_withInvalidConfig_shouldFail() {
    let mut config = Config::default();
    config.pipeline.worker_count = 0;

    assert!(matches!(Controller::from_config(config), Err(AppError::Config(_))));
}

/// A configured database path is created on first use
#[test]
fn test_controller_fromConfig_withDatabasePath_shouldOpenIt() {
    let dir = create_temp_dir().unwrap();
    let mut config = Config::default();
    config.database_path = Some(dir.path().join("namesake.db").to_string_lossy().into_owned());

    let controller = Controller::from_config(config).unwrap();

    assert_eq!(controller.database_stats().unwrap().work_count, 0);
    assert!(dir.path().join("namesake.db").exists());

    let work = tokio_test::block_on(controller.repository().create_work("天元传", "zh")).unwrap();
    let reopened = Controller::from_config(controller.config().clone()).unwrap();
    let works = tokio_test::block_on(reopened.repository().list_works()).unwrap();
    assert_eq!(works.len(), 1);
    assert_eq!(works[0].id, work.id);
}
