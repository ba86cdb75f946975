//! 倒排索引（Utf8 列全文匹配）
//!
//! 分词：按非字母数字字符切分、转小写、去掉空串。
//! 查询匹配“包含全部查询词”的行；没有任何词的查询不匹配任何行。

use std::collections::{BTreeMap, HashSet};
use roaring::RoaringTreemap;
use crate::common::{LanceError, Result, RowAddress};
use crate::format::{MetaReader, MetaWriter};

pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// 不经索引的同语义判定（扫描路径使用）
pub fn text_matches(text: &str, query: &str) -> bool {
    let wanted = tokenize(query);
    if wanted.is_empty() {
        return false;
    }
    let present: HashSet<String> = tokenize(text).into_iter().collect();
    wanted.iter().all(|t| present.contains(t))
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvertedIndex {
    postings: BTreeMap<String, RoaringTreemap>,
    num_docs: u64,
}

impl InvertedIndex {
    /// NULL 行不产生任何词
    pub fn build<'a>(docs: impl IntoIterator<Item = (Option<&'a str>, RowAddress)>) -> Self {
        let mut index = Self::default();
        for (text, addr) in docs {
            index.num_docs += 1;
            for token in text.map(tokenize).unwrap_or_default() {
                index.postings.entry(token).or_default().insert(addr);
            }
        }
        index
    }

    pub fn num_docs(&self)   -> u64   { self.num_docs }
    pub fn num_tokens(&self) -> usize { self.postings.len() }

    pub fn search(&self, query: &str) -> RoaringTreemap {
        let tokens = tokenize(query);
        let mut lists = Vec::with_capacity(tokens.len());
        for t in &tokens {
            match self.postings.get(t) {
                Some(list) => lists.push(list),
                None       => return RoaringTreemap::new(),
            }
        }
        // 从最短的 posting list 开始求交
        lists.sort_by_key(|l| l.len());
        let Some((first, rest)) = lists.split_first() else { return RoaringTreemap::new() };
        rest.iter().fold((*first).clone(), |acc, l| acc & *l)
    }

    pub(crate) fn write_to(&self, w: &mut MetaWriter) -> Result<()> {
        w.u64(self.num_docs).u32(self.postings.len() as u32);
        for (token, rows) in &self.postings {
            let mut buf = Vec::with_capacity(rows.serialized_size());
            rows.serialize_into(&mut buf)
                .map_err(|e| LanceError::invalid(format!("serializing postings of `{token}`: {e}")))?;
            w.str(token).bytes(&buf);
        }
        Ok(())
    }

    pub(crate) fn read_from(r: &mut MetaReader) -> Result<Self> {
        let num_docs = r.u64()?;
        let n = r.len_prefix(8)?;
        let mut postings = BTreeMap::new();
        for _ in 0..n {
            let token = r.str()?;
            let rows = RoaringTreemap::deserialize_from(r.bytes()?)
                .map_err(|e| LanceError::corrupt("inverted index", format!("postings of `{token}`: {e}")))?;
            postings.insert(token, rows);
        }
        Ok(Self { postings, num_docs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> InvertedIndex {
        InvertedIndex::build(vec![
            (Some("The quick brown fox"), 10),
            (Some("quick-silver, QUICK!"), 11),
            (None, 12),
            (Some("lazy brown dog"), 13),
        ])
    }

    #[test]
    fn tokens_are_lowercased_alphanumeric_runs() {
        assert_eq!(tokenize("Hello, World-42!"), vec!["hello", "world", "42"]);
        assert!(tokenize(" ,; ").is_empty());
    }

    #[test]
    fn query_requires_every_token() {
        let idx = sample();
        assert_eq!(idx.num_docs(), 4);
        assert_eq!(idx.search("quick").into_iter().collect::<Vec<_>>(), vec![10, 11]);
        assert_eq!(idx.search("Brown QUICK").into_iter().collect::<Vec<_>>(), vec![10]);
        assert!(idx.search("quick cat").is_empty());
        assert!(idx.search("  ").is_empty());
    }

    #[test]
    fn scan_semantics_agree_with_index() {
        assert!(text_matches("The quick brown fox", "fox QUICK"));
        assert!(!text_matches("lazy brown dog", "brown fox"));
        assert!(!text_matches("anything", ""));
    }

    #[test]
    fn postings_survive_serialization() {
        let idx = sample();
        let mut w = MetaWriter::new();
        idx.write_to(&mut w).unwrap();
        let bytes = w.finish();
        assert_eq!(InvertedIndex::read_from(&mut MetaReader::new(&bytes, "inv")).unwrap(), idx);
    }
}
