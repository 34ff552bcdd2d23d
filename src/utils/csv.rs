//! CSV 读写
//!
//! 底层使用 `csv` crate；这里只负责把记录整理成按表头取值的表。
//! 表头统一转为小写并去掉首尾空白，字段值去掉首尾空白

use csv::{ReaderBuilder, Trim, WriterBuilder};

use crate::error::CsvError;

/// 解析后的一行数据
#[derive(Debug, Clone, PartialEq)]
pub struct CsvRow {
    /// 该行在文件中的起始行号（从1开始，表头为第1行）
    pub line: usize,
    pub values: Vec<String>,
}

/// 解析后的 CSV 表
#[derive(Debug, Clone)]
pub struct CsvTable {
    pub headers: Vec<String>,
    pub rows: Vec<CsvRow>,
}

impl CsvTable {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        let name = name.to_lowercase();
        self.headers.iter().position(|h| *h == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    /// 取某行某列的值；空字符串视为缺失
    pub fn get<'a>(&self, row: &'a CsvRow, name: &str) -> Option<&'a str> {
        let index = self.column_index(name)?;
        row.values
            .get(index)
            .map(|v| v.as_str())
            .filter(|v| !v.is_empty())
    }
}

fn malformed(e: csv::Error) -> CsvError {
    let line = e
        .position()
        .map(|p| p.line() as usize)
        .unwrap_or_default();
    CsvError::Malformed {
        line,
        message: e.to_string(),
    }
}

/// 解析完整的 CSV 文本
pub fn parse(text: &str) -> Result<CsvTable, CsvError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(text.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .map_err(malformed)?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').trim().to_lowercase())
        .collect();
    if headers.iter().all(|h| h.is_empty()) {
        return Err(CsvError::MissingHeader);
    }

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(malformed)?;
        if record.iter().all(str::is_empty) {
            continue;
        }
        rows.push(CsvRow {
            line: record
                .position()
                .map(|p| p.line() as usize)
                .unwrap_or_default(),
            values: record.iter().map(str::to_string).collect(),
        });
    }

    Ok(CsvTable { headers, rows })
}

/// 逐行收集记录，`finish` 时统一写出
#[derive(Debug, Default)]
pub struct CsvWriter {
    records: Vec<Vec<String>>,
}

impl CsvWriter {
    pub fn new(headers: &[&str]) -> Self {
        let mut writer = Self::default();
        writer.write_row(headers.iter().copied());
        writer
    }

    pub fn write_row<I, S>(&mut self, fields: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.records
            .push(fields.into_iter().map(|f| f.as_ref().to_string()).collect());
    }

    /// 输出以 `\n` 结尾的 CSV 文本，必要时为字段加引号
    pub fn finish(self) -> Result<String, CsvError> {
        let mut writer = WriterBuilder::new()
            .flexible(true)
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(Vec::new());
        for record in &self.records {
            writer.write_record(record).map_err(malformed)?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| CsvError::Write(e.to_string()))?;
        String::from_utf8(bytes).map_err(|e| CsvError::Write(e.to_string()))
    }
}
