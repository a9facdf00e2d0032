use serde::Serialize;

use crate::record::Record;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultInfo {
    pub page: u64,
    pub per_page: u64,
    pub total_count: u64,
    pub total_pages: u64,
    pub has_next_page: bool,
    pub has_prev_page: bool,
}

impl ResultInfo {
    pub fn new(page: u64, per_page: u64, total_count: u64) -> Self {
        let total_pages = total_count.div_ceil(per_page.max(1));
        Self {
            page,
            per_page,
            total_count,
            total_pages,
            has_next_page: page < total_pages,
            has_prev_page: page > 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListResponse {
    pub result: Vec<Record>,
    pub result_info: ResultInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadResponse {
    pub result: Record,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WriteResponse {
    pub success: bool,
    pub result: Record,
}

impl WriteResponse {
    pub fn ok(result: Record) -> Self {
        Self {
            success: true,
            result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_info_pages() {
        let info = ResultInfo::new(2, 10, 25);
        assert_eq!(info.total_pages, 3);
        assert!(info.has_next_page);
        assert!(info.has_prev_page);

        let last = ResultInfo::new(3, 10, 25);
        assert!(!last.has_next_page);

        let empty = ResultInfo::new(1, 10, 0);
        assert_eq!(empty.total_pages, 0);
        assert!(!empty.has_next_page);
        assert!(!empty.has_prev_page);
    }
}
