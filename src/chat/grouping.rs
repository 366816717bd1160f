use crate::types::Conversation;
use time::{Date, Duration, OffsetDateTime};

const THIS_WEEK_DAYS: i64 = 7;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DateBucket {
    Today,
    Yesterday,
    ThisWeek,
    Earlier,
}

impl DateBucket {
    pub fn label(self) -> &'static str {
        match self {
            DateBucket::Today => "Today",
            DateBucket::Yesterday => "Yesterday",
            DateBucket::ThisWeek => "This week",
            DateBucket::Earlier => "Earlier",
        }
    }

    /// Buckets are calendar days in `now`'s offset; "this week" is the seven
    /// days before yesterday.
    pub fn for_timestamp(timestamp: OffsetDateTime, now: OffsetDateTime) -> Self {
        let today = now.date();
        let day = timestamp.to_offset(now.offset()).date();
        if day >= today {
            DateBucket::Today
        } else if Some(day) == today.previous_day() {
            DateBucket::Yesterday
        } else if day >= days_before(today, THIS_WEEK_DAYS) {
            DateBucket::ThisWeek
        } else {
            DateBucket::Earlier
        }
    }
}

fn days_before(date: Date, days: i64) -> Date {
    date.checked_sub(Duration::days(days)).unwrap_or(Date::MIN)
}

#[derive(Clone, Debug)]
pub struct ConversationGroup {
    pub bucket: DateBucket,
    pub conversations: Vec<Conversation>,
}

/// Groups by `updated_at`, most recent first inside each group. Empty groups
/// are left out.
pub fn group_by_date(conversations: &[Conversation], now: OffsetDateTime) -> Vec<ConversationGroup> {
    let mut sorted: Vec<&Conversation> = conversations.iter().collect();
    sorted.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

    let mut groups: Vec<ConversationGroup> = Vec::new();
    for conversation in sorted {
        let bucket = DateBucket::for_timestamp(conversation.updated_at, now);
        match groups.iter_mut().find(|group| group.bucket == bucket) {
            Some(group) => group.conversations.push(conversation.clone()),
            None => groups.push(ConversationGroup {
                bucket,
                conversations: vec![conversation.clone()],
            }),
        }
    }
    groups.sort_by_key(|group| group.bucket);
    groups
}
