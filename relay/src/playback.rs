use std::collections::VecDeque;

/// ローカル側へ渡すフレーム
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

/// リモートフレームの再生上の種別
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// 音声・テキストの出力
    Output,
    /// 新しい出力の開始、応答の区切り
    Boundary,
    Other,
}

/// ローカルへの出力キューとターン管理
///
/// 割り込み（バージイン）でキューを破棄し、ターン番号を進める。
/// 抑制が有効な間は、中断されたターンの遅れて届く出力を捨てる。
#[derive(Debug, Default)]
pub struct Playback {
    queue: VecDeque<Frame>,
    turn: u64,
    suppressing: bool,
}

impl Playback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn turn(&self) -> u64 {
        self.turn
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_suppressing(&self) -> bool {
        self.suppressing
    }

    /// フレームをキューに積む
    ///
    /// # Returns
    /// 積んだ場合は `true`、抑制中の出力として捨てた場合は `false`
    pub fn push(&mut self, frame: Frame, kind: FrameKind) -> bool {
        match kind {
            FrameKind::Output if self.suppressing => return false,
            FrameKind::Boundary => self.suppressing = false,
            FrameKind::Output | FrameKind::Other => {}
        }
        self.queue.push_back(frame);
        true
    }

    pub fn pop(&mut self) -> Option<Frame> {
        self.queue.pop_front()
    }

    /// 再生中の出力を打ち切り、新しいターンを開始する
    ///
    /// # Returns
    /// 破棄したフレーム数
    pub fn interrupt(&mut self, suppress: bool) -> usize {
        let dropped = self.queue.len();
        self.queue.clear();
        self.turn += 1;
        self.suppressing = suppress;
        dropped
    }

    /// 残っているフレームをすべて取り出す
    pub fn drain(&mut self) -> impl Iterator<Item = Frame> + '_ {
        self.queue.drain(..)
    }
}
