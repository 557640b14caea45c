//! 轮询选择：从游标起环形扫描，返回第一个容量校验通过的端点。

use crate::endpoint_pool::types::Endpoint;

/// 扫描结果：选中的端点下标，以及是否属于“无可用端点”的兜底返回。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Pick {
    pub index: usize,
    pub not_available: bool,
}

/// 容量校验：请求余额为正，且 token 余额扣除保留量后仍为正。
fn has_capacity(endpoint: &Endpoint, model_name: &str, token_cutoff: i64) -> bool {
    match endpoint.models.get(model_name) {
        Some(m) => m.request_available > 0 && m.token_available - token_cutoff > 0,
        None => false,
    }
}

/// 从 `cursor` 起最多扫描一圈，先到先得，不按剩余容量打分。
/// 全部失败时退回当前游标位置的端点，由调用方决定如何兜底。
pub(crate) fn pick_round_robin(
    endpoints: &[Endpoint],
    cursor: usize,
    model_name: &str,
    token_cutoff: i64,
) -> Pick {
    debug_assert!(!endpoints.is_empty());
    let n = endpoints.len();
    let mut i = cursor % n;

    for _ in 0..n {
        if has_capacity(&endpoints[i], model_name, token_cutoff) {
            return Pick {
                index: i,
                not_available: false,
            };
        }
        i = (i + 1) % n;
    }

    Pick {
        index: cursor % n,
        not_available: true,
    }
}
