#[cfg(test)]
mod tests {
    use crate::domain::error::{AppError, ErrorCode};
    use crate::domain::job::{CancelOutcome, JobId, JobStatus, Stage, StatusExtras};
    use crate::domain::timing::StageTiming;

    fn t(s: &str) -> chrono::DateTime<chrono::Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn test_stage_serialization() {
        assert_eq!(serde_json::to_string(&Stage::Started).unwrap(), "\"started\"");
        assert_eq!(
            serde_json::to_string(&Stage::GeneratingSubtitles).unwrap(),
            "\"generating_subtitles\""
        );
        assert_eq!(
            serde_json::to_string(&Stage::BurningSubtitles).unwrap(),
            "\"burning_subtitles\""
        );
        assert_eq!(
            serde_json::to_string(&Stage::Cancelled).unwrap(),
            "\"cancelled\""
        );
    }

    #[test]
    fn test_stage_deserialization() {
        assert_eq!(
            serde_json::from_str::<Stage>("\"translating\"").unwrap(),
            Stage::Translating
        );
        assert!(serde_json::from_str::<Stage>("\"canceled\"").is_err());
    }

    #[test]
    fn test_error_code_serialization() {
        assert_eq!(
            serde_json::to_string(&ErrorCode::Validation).unwrap(),
            "\"E_VALIDATION\""
        );
        assert_eq!(
            serde_json::to_string(&ErrorCode::NotFound).unwrap(),
            "\"E_NOT_FOUND\""
        );
    }

    #[test]
    fn test_app_error_serialization() {
        let err = AppError::validation("Invalid video URL");
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("E_VALIDATION"));
        assert!(json.contains("recoverable"));
    }

    #[test]
    fn test_job_id_is_plain_string() {
        let id = JobId::from("abc-123");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc-123\"");
    }

    #[test]
    fn test_initial_status_record_shape() {
        let status = JobStatus::initial(t("2025-01-01T00:00:00Z"));
        let value = serde_json::to_value(&status).unwrap();

        assert_eq!(value["stage"], "started");
        assert_eq!(value["progress"], 0);
        assert!(value.get("updatedAt").is_some());
        assert!(value["timing"].get("startTime").is_some());
        assert!(value["timing"]["stages"].as_object().unwrap().is_empty());
        assert!(value["timing"].get("totalDuration").is_none());
        // 結果フィールドは未設定なら出力しない
        assert!(value.get("outputFile").is_none());
        assert!(value.get("error").is_none());
    }

    #[test]
    fn test_completed_status_record_shape() {
        let mut timing = StageTiming::new(t("2025-01-01T00:00:00Z"));
        timing.record(Stage::Downloading, t("2025-01-01T00:00:01Z"));
        timing.record(Stage::Completed, t("2025-01-01T00:00:03Z"));

        let status = JobStatus {
            stage: Stage::Completed,
            message: "done".into(),
            progress: 100,
            updated_at: t("2025-01-01T00:00:03Z"),
            timing,
            extras: StatusExtras {
                output_file: Some("out.mp4".into()),
                detected_language: Some("en".into()),
                segments_count: Some(42),
                error: None,
            },
        };
        let value = serde_json::to_value(&status).unwrap();

        assert_eq!(value["outputFile"], "out.mp4");
        assert_eq!(value["detectedLanguage"], "en");
        assert_eq!(value["segmentsCount"], 42);
        assert_eq!(value["timing"]["totalDuration"], 3.0);
        assert_eq!(value["timing"]["stages"]["downloading"]["duration"], 2.0);

        let back: JobStatus = serde_json::from_value(value).unwrap();
        assert_eq!(back, status);
    }

    #[test]
    fn test_cancel_outcome_serialization() {
        let json = serde_json::to_string(&CancelOutcome { success: false }).unwrap();
        assert_eq!(json, "{\"success\":false}");
    }
}
