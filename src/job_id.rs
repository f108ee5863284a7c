//! スレッドセーフなジョブ ID アロケータ。
//!
//! ビットマップ（`Vec<bool>`）で使用中の ID を管理する。スロット 0 がジョブ ID 1 に対応する。
//! 解放時は末尾の空きスロットを切り詰めるため、ビットマップは常に
//! 「最大の使用中 ID」までの長さに収まる。

use std::sync::{Mutex, PoisonError};

/// ジョブ ID。`[N]` 形式で表示される小さな正の整数。
pub type JobId = i32;

/// 最小未使用 ID を返すアロケータ。
#[derive(Debug, Default)]
pub struct JobIdAllocator {
    consumed: Mutex<Vec<bool>>,
}

impl JobIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 使用中でない最小の正の ID を確保する。
    pub fn acquire(&self) -> JobId {
        let mut consumed = self.consumed.lock().unwrap_or_else(PoisonError::into_inner);
        match consumed.iter().position(|used| !used) {
            Some(slot) => {
                consumed[slot] = true;
                slot as JobId + 1
            }
            None => {
                // 空きがなければスロットを追加。長さがそのまま新しい ID になる。
                consumed.push(true);
                consumed.len() as JobId
            }
        }
    }

    /// ID を解放する。使用中でない ID の解放はプログラミングエラー（パニック）。
    pub fn release(&self, id: JobId) {
        assert!(id > 0, "job id {} is not positive", id);
        let mut consumed = self.consumed.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = (id - 1) as usize;
        assert!(
            slot < consumed.len() && consumed[slot],
            "job id {} released while not held",
            id
        );
        consumed[slot] = false;
        // 末尾の空きスロットを切り詰める
        while consumed.last() == Some(&false) {
            consumed.pop();
        }
    }

    /// 現在使用中の ID 数。
    pub fn in_use(&self) -> usize {
        let consumed = self.consumed.lock().unwrap_or_else(PoisonError::into_inner);
        consumed.iter().filter(|used| **used).count()
    }

    #[cfg(test)]
    fn slots(&self) -> usize {
        self.consumed.lock().unwrap().len()
    }
}
