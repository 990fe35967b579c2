//! Structured item queries.
//!
//! A typed builder over the origin's query-string dialect. `build`
//! always emits parameters in a fixed order so that equal queries
//! produce byte-identical strings, which is what keeps their cache keys
//! equal.

use serde_json::Value;
use thiserror::Error;
use url::form_urlencoded;

/// Upper bound the origin enforces on `limit`.
pub const MAX_LIMIT: u64 = 1_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("limit {0} exceeds the maximum of {MAX_LIMIT}")]
    LimitTooLarge(u64),
    #[error("offset and page are mutually exclusive")]
    OffsetAndPage,
    #[error("invalid value for `{key}`: {value}")]
    InvalidValue { key: &'static str, value: String },
}

impl QueryError {
    fn invalid(key: &'static str, value: impl Into<String>) -> Self {
        Self::InvalidValue {
            key,
            value: value.into(),
        }
    }
}

/// Aggregate counters that can be requested alongside the data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaField {
    /// Every available counter.
    All,
    TotalCount,
    FilterCount,
}

impl MetaField {
    fn as_str(self) -> &'static str {
        match self {
            Self::All => "*",
            Self::TotalCount => "total_count",
            Self::FilterCount => "filter_count",
        }
    }

    fn from_str(value: &str) -> Option<Self> {
        match value {
            "*" => Some(Self::All),
            "total_count" => Some(Self::TotalCount),
            "filter_count" => Some(Self::FilterCount),
            _ => None,
        }
    }
}

/// Builder for a collection query.
#[derive(Debug, Clone, Default)]
pub struct ItemQuery {
    fields: Vec<String>,
    filter: Option<Value>,
    sort: Vec<String>,
    limit: Option<u64>,
    offset: Option<u64>,
    page: Option<u64>,
    meta: Option<MetaField>,
}

impl ItemQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict the returned fields. Repeatable.
    pub fn field(mut self, field: impl Into<String>) -> Self {
        self.fields.push(field.into());
        self
    }

    /// Filter expression in the origin's JSON filter dialect.
    pub fn filter(mut self, filter: Value) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Sort key; prefix with `-` for descending. Repeatable.
    pub fn sort(mut self, key: impl Into<String>) -> Self {
        self.sort.push(key.into());
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn page(mut self, page: u64) -> Self {
        self.page = Some(page);
        self
    }

    pub fn meta(mut self, meta: MetaField) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Rebuild a query from a rendered query string, e.g. one taken off
    /// an inbound proxy request. Unknown parameters are ignored.
    pub fn parse(raw: &str) -> Result<Self, QueryError> {
        let mut query = Self::new();
        for (key, value) in form_urlencoded::parse(raw.as_bytes()) {
            match key.as_ref() {
                "fields" => {
                    query.fields = value.split(',').map(str::to_string).collect();
                }
                "filter" => {
                    let filter: Value = serde_json::from_str(&value)
                        .map_err(|_| QueryError::invalid("filter", value.as_ref()))?;
                    query.filter = Some(filter);
                }
                "sort" => {
                    query.sort = value.split(',').map(str::to_string).collect();
                }
                "limit" => {
                    query.limit = Some(parse_number("limit", &value)?);
                }
                "offset" => {
                    query.offset = Some(parse_number("offset", &value)?);
                }
                "page" => {
                    query.page = Some(parse_number("page", &value)?);
                }
                "meta" => {
                    query.meta = Some(
                        MetaField::from_str(&value)
                            .ok_or_else(|| QueryError::invalid("meta", value.as_ref()))?,
                    );
                }
                _ => {}
            }
        }
        Ok(query)
    }

    /// Render the query string. A query with no explicit limit gets the
    /// origin's maximum, so unbounded collection scans are never sent.
    pub fn build(&self) -> Result<String, QueryError> {
        if let Some(limit) = self.limit
            && limit > MAX_LIMIT
        {
            return Err(QueryError::LimitTooLarge(limit));
        }
        if self.offset.is_some() && self.page.is_some() {
            return Err(QueryError::OffsetAndPage);
        }

        let mut serializer = form_urlencoded::Serializer::new(String::new());
        if !self.fields.is_empty() {
            serializer.append_pair("fields", &self.fields.join(","));
        }
        if let Some(filter) = &self.filter {
            serializer.append_pair("filter", &filter.to_string());
        }
        if !self.sort.is_empty() {
            serializer.append_pair("sort", &self.sort.join(","));
        }
        serializer.append_pair("limit", &self.limit.unwrap_or(MAX_LIMIT).to_string());
        if let Some(offset) = self.offset {
            serializer.append_pair("offset", &offset.to_string());
        }
        if let Some(page) = self.page {
            serializer.append_pair("page", &page.to_string());
        }
        if let Some(meta) = self.meta {
            serializer.append_pair("meta", meta.as_str());
        }
        Ok(serializer.finish())
    }
}

fn parse_number(key: &'static str, value: &str) -> Result<u64, QueryError> {
    value
        .parse()
        .map_err(|_| QueryError::invalid(key, value))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn empty_query_defaults_to_max_limit() {
        assert_eq!(ItemQuery::new().build().expect("build"), "limit=1000");
    }

    #[test]
    fn all_parameters_render_in_fixed_order() {
        let query = ItemQuery::new()
            .field("id")
            .field("title")
            .filter(json!({"status": {"_eq": "published"}}))
            .sort("-date")
            .limit(25)
            .page(3)
            .meta(MetaField::FilterCount)
            .build()
            .expect("build");

        assert_eq!(
            query,
            "fields=id%2Ctitle\
             &filter=%7B%22status%22%3A%7B%22_eq%22%3A%22published%22%7D%7D\
             &sort=-date&limit=25&page=3&meta=filter_count"
        );
    }

    #[test]
    fn equal_queries_build_identical_strings() {
        let a = ItemQuery::new().field("id").limit(10).build().expect("a");
        let b = ItemQuery::new().field("id").limit(10).build().expect("b");
        assert_eq!(a, b);
    }

    #[test]
    fn limit_above_maximum_is_refused() {
        let err = ItemQuery::new().limit(1_001).build().expect_err("limit");
        assert_eq!(err, QueryError::LimitTooLarge(1_001));
    }

    #[test]
    fn limit_at_maximum_is_allowed() {
        let query = ItemQuery::new().limit(MAX_LIMIT).build().expect("build");
        assert_eq!(query, "limit=1000");
    }

    #[test]
    fn offset_and_page_together_are_refused() {
        let err = ItemQuery::new()
            .offset(10)
            .page(2)
            .build()
            .expect_err("pagination");
        assert_eq!(err, QueryError::OffsetAndPage);
    }

    #[test]
    fn parse_round_trips_a_built_query() {
        let original = ItemQuery::new()
            .field("id")
            .field("title")
            .filter(json!({"status": {"_eq": "published"}}))
            .sort("-date")
            .limit(25)
            .page(3)
            .meta(MetaField::FilterCount)
            .build()
            .expect("build");

        let reparsed = ItemQuery::parse(&original)
            .expect("parse")
            .build()
            .expect("rebuild");
        assert_eq!(reparsed, original);
    }

    #[test]
    fn parse_ignores_unknown_parameters() {
        let query = ItemQuery::parse("limit=5&access_token=x").expect("parse");
        assert_eq!(query.build().expect("build"), "limit=5");
    }

    #[test]
    fn parse_rejects_malformed_numbers() {
        let err = ItemQuery::parse("limit=ten").expect_err("parse");
        assert_eq!(
            err,
            QueryError::InvalidValue {
                key: "limit",
                value: "ten".to_string()
            }
        );
    }

    #[test]
    fn meta_all_renders_as_star() {
        let query = ItemQuery::new().meta(MetaField::All).build().expect("build");
        assert_eq!(query, "limit=1000&meta=*");
    }
}
