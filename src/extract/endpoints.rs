//! Built-in extractors for the creator marketplace endpoints.

use serde_json::{Map, Value};

use super::field::Field;
use super::{round2, Extraction, RecordDraft};

type Fields = Map<String, Value>;

fn put(fields: &mut Fields, key: &str, value: impl Into<Value>) {
    fields.insert(key.to_string(), value.into());
}

fn fields_only(fields: Fields) -> Extraction {
    Extraction {
        fields,
        records: Vec::new(),
    }
}

/// Non-empty trimmed strings of an array, joined.
fn join_strings(items: &[Value], separator: &str) -> String {
    items
        .iter()
        .map(|v| Field::of(v).str_or("").trim().to_string())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(separator)
}

/// `name (12.3%)` for the first `limit` entries of a `[{name, percent}]` list,
/// where percent is a 0..1 ratio.
fn top_shares(items: &[Value], limit: usize) -> String {
    items
        .iter()
        .take(limit)
        .filter_map(|item| {
            let item = Field::of(item);
            let name = item.get("name").str_or("");
            let percent = item.get("percent");
            if name.is_empty() || !percent.is_present() {
                return None;
            }
            let share = (percent.f64_or(0.0) * 1000.0).round() / 10.0;
            Some(format!("{} ({}%)", name, share))
        })
        .collect::<Vec<_>>()
        .join(" 、")
}

/// Creator profile and pricing.
pub(super) fn blogger(data: Field<'_>) -> Extraction {
    let mut fields = Fields::new();
    put(&mut fields, "nickname", data.get("name").str_or(""));
    put(&mut fields, "red_id", data.get("redId").str_or(""));
    put(&mut fields, "fans_count", data.get("fansCount").i64_or(0));
    put(
        &mut fields,
        "like_collect_count",
        data.get("likeCollectCountInfo").str_or(""),
    );
    put(&mut fields, "region", data.get("location").str_or(""));
    put(&mut fields, "agency_name", data.path(&["noteSign", "name"]).str_or(""));
    put(&mut fields, "current_level", data.get("currentLevel").i64_or(0));

    // Prices live either under price_info or at the top level.
    let prices = if data.get("price_info").is_present() {
        data.get("price_info")
    } else {
        data
    };
    put(&mut fields, "graphic_price", prices.get("picturePrice").f64_or(0.0));
    put(&mut fields, "video_price", prices.get("videoPrice").f64_or(0.0));

    let content_tags = data
        .get("contentTags")
        .array_or_empty()
        .iter()
        .filter_map(|tag| {
            let tag = Field::of(tag);
            let first = tag.get("taxonomy1Tag").str_or("");
            if first.is_empty() {
                return None;
            }
            let second = tag_text(tag.get("taxonomy2Tag"));
            Some(if second.is_empty() {
                first
            } else {
                format!("{}-{}", first, second)
            })
        })
        .collect::<Vec<_>>()
        .join(", ");
    put(&mut fields, "content_tags", content_tags);
    put(
        &mut fields,
        "feature_tags",
        join_strings(data.get("featureTags").array_or_empty(), ", "),
    );
    put(
        &mut fields,
        "personal_tags",
        join_strings(data.get("personalTags").array_or_empty(), ", "),
    );
    fields_only(fields)
}

/// taxonomy2Tag is sometimes a string and sometimes a list of strings.
fn tag_text(tag: Field<'_>) -> String {
    let items = tag.array_or_empty();
    if items.is_empty() {
        tag.str_or("")
    } else {
        join_strings(items, "/")
    }
}

/// Median exposure/read/engagement and like ratios.
pub(super) fn notes_rate(data: Field<'_>) -> Extraction {
    let mut fields = Fields::new();
    put(&mut fields, "exposure_median", data.get("impMedian").i64_or(0));
    put(&mut fields, "read_median", data.get("readMedian").i64_or(0));
    put(&mut fields, "engage_median", data.get("mEngagementNum").i64_or(0));
    put(
        &mut fields,
        "hundred_like_ratio",
        data.get("hundredLikePercent").f64_or(0.0),
    );
    put(
        &mut fields,
        "thousand_like_ratio",
        data.get("thousandLikePercent").f64_or(0.0),
    );
    fields_only(fields)
}

pub(super) fn fans_summary(data: Field<'_>) -> Extraction {
    let mut fields = Fields::new();
    let rate = data.get("activeFansRate").percent_or(0.0);
    put(&mut fields, "active_fans_ratio", rate / 100.0);
    put(&mut fields, "fans_increase_num", data.get("fansIncreaseNum").i64_or(0));
    fields_only(fields)
}

/// Audience distributions.
pub(super) fn fans_profile(data: Field<'_>) -> Extraction {
    let mut fields = Fields::new();

    let mut ages = Fields::new();
    for age in data.get("ages").array_or_empty() {
        let age = Field::of(age);
        let group = age.get("group").str_or("");
        if !group.is_empty() {
            ages.insert(group, Value::from(age.get("percent").f64_or(0.0)));
        }
    }
    put(&mut fields, "age_distribution", Value::Object(ages));

    let gender = data.get("gender");
    put(&mut fields, "male_ratio", gender.get("male").f64_or(0.0));
    put(&mut fields, "female_ratio", gender.get("female").f64_or(0.0));

    put(
        &mut fields,
        "top_interests",
        top_shares(data.get("interests").array_or_empty(), 5),
    );
    put(
        &mut fields,
        "top_cities",
        top_shares(data.get("cities").array_or_empty(), 3),
    );

    let mut apple = 0.0;
    let mut huawei = 0.0;
    for device in data.get("devices").array_or_empty() {
        let device = Field::of(device);
        let name = device.get("name").str_or("").to_lowercase();
        let percent = device.get("percent").f64_or(0.0);
        if name.contains("apple") || name.contains("苹果") {
            apple += percent;
        } else if name.contains("huawei") || name.contains("华为") {
            huawei += percent;
        }
    }
    put(&mut fields, "apple_ratio", round2(apple));
    put(&mut fields, "huawei_ratio", round2(huawei));
    fields_only(fields)
}

/// Recent notes as separate records, plus aggregates on the profile.
pub(super) fn notes_detail(data: Field<'_>) -> Extraction {
    let mut records = Vec::new();
    let mut like_total = 0i64;
    let mut video_count = 0i64;
    let mut brands: Vec<String> = Vec::new();
    let mut last_date = String::new();

    for note in data.get("list").array_or_empty() {
        let note = Field::of(note);
        let id = note.get("noteId").str_or(&note.get("id").str_or(""));
        let likes = note.get("likeNum").i64_or(0).max(0);
        let is_video = note.get("isVideo").bool_or(false);
        let brand = note.get("brandName").str_or("").trim().to_string();
        let date = note.get("date").str_or("");

        like_total += likes;
        if is_video {
            video_count += 1;
        }
        if !brand.is_empty() && !brands.contains(&brand) {
            brands.push(brand.clone());
        }
        if date > last_date {
            last_date = date.clone();
        }

        if id.is_empty() {
            continue;
        }
        let mut fields = Fields::new();
        put(&mut fields, "note_id", id.clone());
        put(&mut fields, "title", note.get("title").str_or(""));
        put(&mut fields, "like_count", likes);
        put(&mut fields, "is_video", is_video);
        put(&mut fields, "brand_name", brand);
        put(&mut fields, "date", date);
        records.push(RecordDraft {
            kind: "note".to_string(),
            natural_key: format!("note:{}", id),
            fields,
        });
    }

    let mut fields = Fields::new();
    put(&mut fields, "recent_like_total", like_total);
    put(&mut fields, "recent_video_count", video_count);
    brands.sort();
    put(&mut fields, "cooperated_brands", brands.join(", "));
    put(&mut fields, "last_note_date", last_date);
    Extraction { fields, records }
}

/// Cost estimates shown on the "by cost" tab.
pub(super) fn data_summary(data: Field<'_>) -> Extraction {
    let mut fields = Fields::new();
    put(&mut fields, "reply_rate_48h", data.get("responseRate").f64_or(0.0));
    put(
        &mut fields,
        "cooperate_industry",
        join_strings(data.get("tradeNames").array_or_empty(), ", "),
    );
    put(&mut fields, "est_graphic_cpm", data.get("estimatePictureCpm").f64_or(0.0));
    put(&mut fields, "est_video_cpm", data.get("estimateVideoCpm").f64_or(0.0));
    put(&mut fields, "est_graphic_cpc", data.get("pictureReadCost").f64_or(0.0));
    put(&mut fields, "est_video_cpc", data.get("videoReadCostV2").f64_or(0.0));
    put(
        &mut fields,
        "est_graphic_cpe",
        data.get("estimatePictureEngageCost").f64_or(0.0),
    );
    put(
        &mut fields,
        "est_video_cpe",
        data.get("estimateVideoEngageCost").f64_or(0.0),
    );
    fields_only(fields)
}

/// Message list rows; natural key is the message id.
pub(super) fn message_list(data: Field<'_>) -> Extraction {
    let records = data
        .get("messageList")
        .array_or_empty()
        .iter()
        .filter_map(|message| {
            let message = Field::of(message);
            let id = message.get("id").str_or("");
            if id.is_empty() {
                return None;
            }
            let mut fields = Fields::new();
            put(&mut fields, "message_id", id.clone());
            put(&mut fields, "title", message.get("title").str_or(""));
            put(&mut fields, "content", message.get("content").str_or(""));
            put(&mut fields, "created_at", message.get("createTime").str_or(""));
            Some(RecordDraft {
                kind: "message".to_string(),
                natural_key: format!("message:{}", id),
                fields,
            })
        })
        .collect();
    Extraction {
        fields: Fields::new(),
        records,
    }
}
