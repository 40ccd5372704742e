//! Nested v2 study documents to flat records

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

use crate::models::{StudyRecord, DATA_SOURCE_API};

const SEPARATOR: &str = ", ";

fn text(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn at(study: &Value, pointer: &str) -> Option<String> {
    text(study.pointer(pointer))
}

/// Join a string array, or a named field of each object in an array
fn joined(study: &Value, pointer: &str, field: Option<&str>) -> Option<String> {
    let items = study.pointer(pointer)?.as_array()?;
    let parts: Vec<String> = items
        .iter()
        .filter_map(|item| match field {
            Some(name) => text(item.get(name)),
            None => text(Some(item)),
        })
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(SEPARATOR))
    }
}

impl StudyRecord {
    /// Flatten one study document. Only the first listed location is kept.
    pub fn from_study(study: &Value, extracted_at: DateTime<Utc>) -> Self {
        const ID: &str = "/protocolSection/identificationModule";
        const STATUS: &str = "/protocolSection/statusModule";
        const LOCATION: &str = "/protocolSection/contactsLocationsModule/locations/0";

        StudyRecord {
            nct_id: at(study, &format!("{ID}/nctId")),
            brief_title: at(study, &format!("{ID}/briefTitle")),
            official_title: at(study, &format!("{ID}/officialTitle")),
            overall_status: at(study, &format!("{STATUS}/overallStatus")),
            study_type: at(study, "/protocolSection/designModule/studyType"),
            phase: joined(study, "/protocolSection/designModule/phases", None),
            condition: joined(study, "/protocolSection/conditionsModule/conditions", None),
            intervention_name: joined(
                study,
                "/protocolSection/armsInterventionsModule/interventions",
                Some("name"),
            ),
            primary_outcome_measure: joined(
                study,
                "/protocolSection/outcomesModule/primaryOutcomes",
                Some("measure"),
            ),
            study_first_submit_date: at(study, &format!("{STATUS}/studyFirstSubmitDate")),
            last_update_submit_date: at(study, &format!("{STATUS}/lastUpdateSubmitDate")),
            completion_date: at(study, &format!("{STATUS}/completionDateStruct/date")),
            location_city: at(study, &format!("{LOCATION}/city")),
            location_state: at(study, &format!("{LOCATION}/state")),
            location_country: at(study, &format!("{LOCATION}/country")),
            sponsor_name: at(
                study,
                "/protocolSection/sponsorCollaboratorsModule/leadSponsor/name",
            ),
            extraction_timestamp: Some(extracted_at.to_rfc3339_opts(SecondsFormat::Secs, true)),
            data_source: Some(DATA_SOURCE_API.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn extracted() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 8, 7, 0, 0).unwrap()
    }

    #[test]
    fn test_full_document() {
        let study = json!({
            "protocolSection": {
                "identificationModule": {
                    "nctId": "NCT05000001",
                    "briefTitle": "Drug A in Asthma",
                    "officialTitle": "A Randomized Trial of Drug A"
                },
                "statusModule": {
                    "overallStatus": "RECRUITING",
                    "studyFirstSubmitDate": "2023-05-01",
                    "lastUpdateSubmitDate": "2024-01-02",
                    "completionDateStruct": { "date": "2025-12", "type": "ESTIMATED" }
                },
                "designModule": { "studyType": "INTERVENTIONAL", "phases": ["PHASE2", "PHASE3"] },
                "conditionsModule": { "conditions": ["Asthma", "COPD"] },
                "armsInterventionsModule": {
                    "interventions": [{ "type": "DRUG", "name": "Drug A" }, { "name": "Placebo" }]
                },
                "outcomesModule": { "primaryOutcomes": [{ "measure": "FEV1" }] },
                "contactsLocationsModule": {
                    "locations": [
                        { "city": "Boston", "state": "Massachusetts", "country": "United States" },
                        { "city": "Paris", "country": "France" }
                    ]
                },
                "sponsorCollaboratorsModule": { "leadSponsor": { "name": "Acme Pharma" } }
            }
        });

        let record = StudyRecord::from_study(&study, extracted());

        assert_eq!(record.nct_id.as_deref(), Some("NCT05000001"));
        assert_eq!(record.official_title.as_deref(), Some("A Randomized Trial of Drug A"));
        assert_eq!(record.phase.as_deref(), Some("PHASE2, PHASE3"));
        assert_eq!(record.condition.as_deref(), Some("Asthma, COPD"));
        assert_eq!(record.intervention_name.as_deref(), Some("Drug A, Placebo"));
        assert_eq!(record.primary_outcome_measure.as_deref(), Some("FEV1"));
        assert_eq!(record.completion_date.as_deref(), Some("2025-12"));
        assert_eq!(record.location_city.as_deref(), Some("Boston"));
        assert_eq!(record.location_country.as_deref(), Some("United States"));
        assert_eq!(record.sponsor_name.as_deref(), Some("Acme Pharma"));
        assert_eq!(record.extraction_timestamp.as_deref(), Some("2024-01-08T07:00:00Z"));
        assert_eq!(record.data_source.as_deref(), Some("clinical_trials_api"));
    }

    #[test]
    fn test_sparse_document() {
        let study = json!({
            "protocolSection": {
                "identificationModule": { "nctId": "  " },
                "designModule": { "phases": [] }
            }
        });
        let record = StudyRecord::from_study(&study, extracted());
        assert_eq!(record.nct_id, None);
        assert_eq!(record.phase, None);
        assert_eq!(record.location_city, None);
        assert!(record.data_source.is_some());
    }
}
