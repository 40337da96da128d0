// Converts the provider's calendar payloads into CalendarDay lists.
// The provider answers in several shapes depending on endpoint and account.

use chrono::NaiveDate;
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::calendar::{CalendarDay, DayStatus, ISO_DATE_FORMAT};

const DATE_FIELDS: [&str; 4] = ["date", "day", "calendarDate", "dt"];
const PRICE_FIELDS: [&str; 2] = ["price", "nightlyPrice"];
const ALLOTMENT_FIELDS: [&str; 2] = ["allotment", "availableUnits"];
const MIN_STAY_FIELDS: [&str; 2] = ["minNights", "minimumStay"];
const DAY_LIST_FIELDS: [&str; 2] = ["days", "calendar"];
const DAY_OWNER_FIELDS: [&str; 2] = ["listingId", "listing_id"];
const LISTING_ID_FIELDS: [&str; 4] = ["listingId", "listing_id", "_id", "id"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseShape {
    // {"data": {"days": [...]}}
    NestedDayList,
    // [{"date": ...}, ...]
    RootDayList,
    // [{"listingId": ..., "days": [...]}, ...]
    ListingArray,
    // {"listingId": ..., "days": [...]}
    SingleListing,
}

type ShapeDetector = fn(&Value) -> bool;

// Tried in order, first match wins
pub const SHAPE_DETECTORS: &[(ResponseShape, ShapeDetector)] = &[
    (ResponseShape::NestedDayList, is_nested_day_list as ShapeDetector),
    (ResponseShape::RootDayList, is_root_day_list as ShapeDetector),
    (ResponseShape::ListingArray, is_listing_array as ShapeDetector),
    (ResponseShape::SingleListing, is_single_listing as ShapeDetector),
];

pub fn detect_shape(payload: &Value) -> Option<ResponseShape> {
    SHAPE_DETECTORS
        .iter()
        .find(|(_, detector)| detector(payload))
        .map(|(shape, _)| *shape)
}

fn is_nested_day_list(payload: &Value) -> bool {
    payload.pointer("/data/days").map_or(false, Value::is_array)
}

fn is_root_day_list(payload: &Value) -> bool {
    match payload.as_array() {
        Some(items) => match items.first() {
            None => true,
            Some(first) => first
                .as_object()
                .map_or(false, |object| DATE_FIELDS.iter().any(|key| object.contains_key(*key))),
        },
        None => false,
    }
}

fn is_listing_array(payload: &Value) -> bool {
    match payload.as_array() {
        Some(items) if !items.is_empty() => items
            .iter()
            .all(|item| item.as_object().and_then(embedded_days).is_some()),
        _ => false,
    }
}

fn is_single_listing(payload: &Value) -> bool {
    payload.as_object().and_then(embedded_days).is_some()
}

fn embedded_days(object: &Map<String, Value>) -> Option<&Vec<Value>> {
    DAY_LIST_FIELDS
        .iter()
        .find_map(|key| object.get(*key).and_then(Value::as_array))
}

// Groups the payload's days by listing id. `fallback_id` owns days that name no
// listing at all; without one those days are dropped.
pub fn normalize_payload(
    payload: &Value,
    fallback_id: Option<&str>,
) -> HashMap<String, Vec<CalendarDay>> {
    let mut calendars: HashMap<String, Vec<CalendarDay>> = HashMap::new();

    let Some(shape) = detect_shape(payload) else {
        warn!("Unrecognized calendar payload shape, ignoring response");
        return calendars;
    };
    debug!("Calendar payload detected as {:?}", shape);

    let mut dropped = 0usize;
    let mut collect = |days: &[Value], listing_owner: Option<String>| {
        for raw in days {
            let owner = raw
                .as_object()
                .and_then(|object| id_field(object, &DAY_OWNER_FIELDS))
                .or_else(|| listing_owner.clone())
                .or_else(|| fallback_id.map(str::to_string));
            match (owner, normalize_day(raw)) {
                (Some(owner), Some(day)) => calendars.entry(owner).or_default().push(day),
                _ => dropped += 1,
            }
        }
    };

    match shape {
        ResponseShape::NestedDayList => {
            let data = payload.get("data").and_then(Value::as_object);
            let days = data.and_then(|d| d.get("days")).and_then(Value::as_array);
            if let (Some(data), Some(days)) = (data, days) {
                collect(days.as_slice(), id_field(data, &LISTING_ID_FIELDS));
            }
        }
        ResponseShape::RootDayList => {
            if let Some(days) = payload.as_array() {
                collect(days.as_slice(), None);
            }
        }
        ResponseShape::ListingArray => {
            for listing in payload.as_array().into_iter().flatten() {
                if let Some(object) = listing.as_object() {
                    if let Some(days) = embedded_days(object) {
                        collect(days.as_slice(), id_field(object, &LISTING_ID_FIELDS));
                    }
                }
            }
        }
        ResponseShape::SingleListing => {
            if let Some(object) = payload.as_object() {
                if let Some(days) = embedded_days(object) {
                    collect(days.as_slice(), id_field(object, &LISTING_ID_FIELDS));
                }
            }
        }
    }

    if dropped > 0 {
        warn!("Dropped {} calendar days without a usable date or owner", dropped);
    }
    calendars
}

pub fn normalize_day(raw: &Value) -> Option<CalendarDay> {
    let object = raw.as_object()?;
    let date = DATE_FIELDS
        .iter()
        .find_map(|key| object.get(*key).and_then(parse_day_date))?;

    let price = PRICE_FIELDS
        .iter()
        .find_map(|key| object.get(*key).and_then(parse_price));
    let allotment = ALLOTMENT_FIELDS
        .iter()
        .find_map(|key| object.get(*key).and_then(parse_count));

    let status = match allotment {
        Some(units) if units > 0 => DayStatus::Available,
        Some(_) => DayStatus::Unavailable,
        None => explicit_status(object)
            .or_else(|| status_from_blocks(object))
            .unwrap_or(DayStatus::Unknown),
    };

    let check_in_allowed = restriction_flag(object, "checkInAllowed", &["cta", "closedToArrival"]);
    let check_out_allowed =
        restriction_flag(object, "checkOutAllowed", &["ctd", "closedToDeparture"]);
    let min_stay = MIN_STAY_FIELDS
        .iter()
        .find_map(|key| object.get(*key).and_then(parse_count))
        .unwrap_or(1)
        .max(1);

    Some(CalendarDay {
        date,
        price,
        allotment,
        status,
        check_in_allowed,
        check_out_allowed,
        min_stay,
    })
}

fn parse_day_date(value: &Value) -> Option<NaiveDate> {
    // Timestamps such as 2026-01-10T00:00:00Z keep their date part
    let text = value.as_str()?.trim().get(..10)?;
    NaiveDate::parse_from_str(text, ISO_DATE_FORMAT).ok()
}

fn parse_price(value: &Value) -> Option<f64> {
    let amount = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        Value::Object(object) => ["amount", "value"]
            .iter()
            .find_map(|key| object.get(*key).and_then(parse_price)),
        _ => None,
    }?;
    (amount.is_finite() && amount >= 0.0).then_some(amount)
}

fn parse_count(value: &Value) -> Option<u32> {
    let count = match value {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.trim().parse::<u64>().ok(),
        _ => None,
    }?;
    u32::try_from(count).ok()
}

fn explicit_status(object: &Map<String, Value>) -> Option<DayStatus> {
    let status = object.get("status")?.as_str()?.trim().to_ascii_lowercase();
    Some(match status.as_str() {
        "available" => DayStatus::Available,
        "unavailable" | "booked" | "blocked" | "reserved" => DayStatus::Unavailable,
        _ => DayStatus::Unknown,
    })
}

fn status_from_blocks(object: &Map<String, Value>) -> Option<DayStatus> {
    let blocks = object.get("blocks")?.as_object()?;
    if blocks.values().any(|flag| flag.as_bool() == Some(true)) {
        Some(DayStatus::Unavailable)
    } else {
        Some(DayStatus::Available)
    }
}

// Positive flag wins; otherwise the first present "closed" flag is negated
fn restriction_flag(object: &Map<String, Value>, allowed: &str, closed: &[&str]) -> bool {
    if let Some(flag) = object.get(allowed).and_then(Value::as_bool) {
        return flag;
    }
    closed
        .iter()
        .find_map(|key| object.get(*key).and_then(Value::as_bool))
        .map_or(true, |is_closed| !is_closed)
}

fn id_field(object: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match object.get(*key)? {
        Value::String(id) if !id.trim().is_empty() => Some(id.trim().to_string()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::fixtures::date;
    use serde_json::json;
    use test_case::test_case;

    #[test_case(json!({ "date": "2026-01-10" }); "date")]
    #[test_case(json!({ "day": "2026-01-10" }); "day")]
    #[test_case(json!({ "calendarDate": "2026-01-10" }); "calendar date")]
    #[test_case(json!({ "dt": "2026-01-10T00:00:00Z" }); "timestamp")]
    #[test_case(json!({ "date": "garbage", "day": "2026-01-10" }); "first parseable alias")]
    fn test_date_aliases(raw: Value) {
        assert_eq!(normalize_day(&raw).unwrap().date, date("2026-01-10"));
    }

    #[test_case(json!({ "dt": 20260110 }); "numeric date")]
    #[test_case(json!({ "date": "10/01/2026" }); "foreign format")]
    #[test_case(json!({ "price": 100 }); "no date")]
    #[test_case(json!("2026-01-10"); "not an object")]
    fn test_day_without_usable_date_is_dropped(raw: Value) {
        assert!(normalize_day(&raw).is_none());
    }

    #[test_case(json!(120.5), Some(120.5); "number")]
    #[test_case(json!("99.90"), Some(99.9); "numeric string")]
    #[test_case(json!({ "amount": 80 }), Some(80.0); "amount object")]
    #[test_case(json!({ "value": "75" }), Some(75.0); "value object")]
    #[test_case(json!(-5), None; "negative")]
    #[test_case(json!("free"), None; "not numeric")]
    fn test_price_forms(price: Value, expected: Option<f64>) {
        let day = normalize_day(&json!({ "date": "2026-01-10", "price": price })).unwrap();
        assert_eq!(day.price, expected);
    }

    #[test]
    fn test_nightly_price_alias() {
        let day = normalize_day(&json!({ "date": "2026-01-10", "nightlyPrice": 210 })).unwrap();
        assert_eq!(day.price, Some(210.0));
    }

    #[test_case(json!({ "status": "available" }), DayStatus::Available; "available")]
    #[test_case(json!({ "status": "Booked" }), DayStatus::Unavailable; "booked")]
    #[test_case(json!({ "status": "reserved" }), DayStatus::Unavailable; "reserved")]
    #[test_case(json!({ "status": "pending" }), DayStatus::Unknown; "unrecognized")]
    #[test_case(json!({ "blocks": { "owner": false, "maintenance": true } }), DayStatus::Unavailable; "any block")]
    #[test_case(json!({ "blocks": { "owner": false } }), DayStatus::Available; "no blocks")]
    #[test_case(json!({}), DayStatus::Unknown; "nothing")]
    #[test_case(json!({ "status": "available", "allotment": 0 }), DayStatus::Unavailable; "allotment wins over status")]
    #[test_case(json!({ "status": "booked", "availableUnits": 2 }), DayStatus::Available; "units win over status")]
    fn test_status_derivation(mut raw: Value, expected: DayStatus) {
        raw["date"] = json!("2026-01-10");
        assert_eq!(normalize_day(&raw).unwrap().status, expected);
    }

    #[test_case(json!({}), true, true; "defaults")]
    #[test_case(json!({ "cta": true, "ctd": true }), false, false; "short flags")]
    #[test_case(json!({ "closedToArrival": true, "closedToDeparture": false }), false, true; "long flags")]
    #[test_case(json!({ "checkInAllowed": true, "cta": true }), true, true; "explicit allowed wins")]
    #[test_case(json!({ "checkOutAllowed": false }), true, false; "explicit closed departure")]
    fn test_arrival_and_departure_flags(mut raw: Value, check_in: bool, check_out: bool) {
        raw["date"] = json!("2026-01-10");
        let day = normalize_day(&raw).unwrap();
        assert_eq!(day.check_in_allowed, check_in);
        assert_eq!(day.check_out_allowed, check_out);
    }

    #[test_case(json!({ "minNights": 3 }), 3; "min nights")]
    #[test_case(json!({ "minimumStay": "2" }), 2; "minimum stay string")]
    #[test_case(json!({ "minNights": 0 }), 1; "clamped")]
    #[test_case(json!({}), 1; "default")]
    fn test_minimum_stay(mut raw: Value, expected: u32) {
        raw["date"] = json!("2026-01-10");
        assert_eq!(normalize_day(&raw).unwrap().min_stay, expected);
    }

    #[test_case(json!({ "data": { "days": [] } }), Some(ResponseShape::NestedDayList); "nested")]
    #[test_case(json!([{ "date": "2026-01-10" }]), Some(ResponseShape::RootDayList); "root days")]
    #[test_case(json!([]), Some(ResponseShape::RootDayList); "empty array")]
    #[test_case(json!([{ "id": "A", "days": [] }, { "id": "B", "calendar": [] }]), Some(ResponseShape::ListingArray); "listing array")]
    #[test_case(json!({ "listingId": "A", "calendar": [] }), Some(ResponseShape::SingleListing); "single listing")]
    #[test_case(json!({ "results": [] }), None; "unknown object")]
    #[test_case(json!([{ "id": "A" }]), None; "array without days")]
    #[test_case(json!("ok"), None; "scalar")]
    fn test_detect_shape(payload: Value, expected: Option<ResponseShape>) {
        assert_eq!(detect_shape(&payload), expected);
    }

    #[test]
    fn test_listing_array_groups_by_listing_id() {
        let payload = json!([
            { "listingId": "A", "days": [
                { "date": "2026-01-10", "allotment": 1 },
                { "date": "2026-01-11", "allotment": 1 }
            ]},
            { "_id": "B", "calendar": [{ "date": "2026-01-10", "status": "booked" }] },
            { "id": 42, "days": [{ "date": "2026-01-10" }] }
        ]);

        let calendars = normalize_payload(&payload, None);

        assert_eq!(calendars.len(), 3);
        assert_eq!(calendars["A"].len(), 2);
        assert_eq!(calendars["B"][0].status, DayStatus::Unavailable);
        assert!(calendars.contains_key("42"));
    }

    #[test]
    fn test_day_level_listing_id_overrides_owner() {
        let payload = json!({ "data": { "days": [
            { "date": "2026-01-10", "listingId": "A" },
            { "date": "2026-01-10", "listing_id": "B" },
            { "date": "2026-01-11" }
        ]}});

        let calendars = normalize_payload(&payload, Some("C"));

        assert_eq!(calendars["A"].len(), 1);
        assert_eq!(calendars["B"].len(), 1);
        assert_eq!(calendars["C"][0].date, date("2026-01-11"));
    }

    #[test]
    fn test_unowned_days_are_dropped_without_fallback() {
        let payload = json!([{ "date": "2026-01-10" }, { "date": "2026-01-11", "listingId": "A" }]);

        let calendars = normalize_payload(&payload, None);

        assert_eq!(calendars.len(), 1);
        assert_eq!(calendars["A"].len(), 1);
    }

    #[test]
    fn test_single_listing_uses_fallback_when_unnamed() {
        let payload = json!({ "days": [{ "date": "2026-01-10", "price": "150" }, { "price": 1 }] });

        let calendars = normalize_payload(&payload, Some("A"));

        assert_eq!(calendars["A"].len(), 1);
        assert_eq!(calendars["A"][0].price, Some(150.0));
    }

    #[test]
    fn test_unknown_shape_yields_empty_map() {
        assert!(normalize_payload(&json!({ "error": "nope" }), Some("A")).is_empty());
    }
}
