//! # lance-storage-engine 使用案例
//!
//! 演示核心功能：
//!
//! 1. 创建数据集（本地目录）
//! 2. 追加、删除，版本与快照读取
//! 3. 标量 / 全文 / 向量索引
//! 4. 过滤扫描与最近邻检索（含索引过期后的平扫补齐）
//! 5. Schema 演进
//! 6. Compaction、恢复旧版本、清理

use std::sync::Arc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use lance_storage_engine::{
    scanner::DISTANCE, Array, CompactionOptions, DataType, Dataset, Field, IndexParams, MetricType, Predicate,
    RecordBatch, Result, Schema, Value, VectorIndexParams, WriteParams,
};

const DIM: usize = 16;

fn products(ids: std::ops::Range<i64>, rng: &mut StdRng) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        Field::new("id",       DataType::Int64, false),
        Field::new("title",    DataType::Utf8,  true),
        Field::new("price",    DataType::Float64, true),
        Field::vector("embedding", DIM as u32),
    ])?);
    let adjectives = ["red", "blue", "wooden", "steel", "tiny"];
    let nouns = ["chair", "table", "lamp", "shelf"];
    let titles: Vec<String> = ids.clone()
        .map(|i| format!("{} {}", adjectives[i as usize % 5], nouns[i as usize % 4]))
        .collect();
    let n = titles.len();
    let flat: Vec<f32> = (0..n * DIM).map(|_| rng.random::<f32>()).collect();
    RecordBatch::try_new(schema, vec![
        Array::from_i64(ids.clone().collect()),
        Array::from_strings(&titles),
        Array::from_f64(ids.map(|i| 5.0 + (i % 97) as f64).collect()),
        Array::from_vectors(DIM, flat)?,
    ])
}

fn print_ids(label: &str, batch: &RecordBatch) {
    let ids: Vec<String> = batch.column(0).to_values().iter().map(Value::to_string).collect();
    println!("    {label}: [{}]", ids.join(", "));
}

fn main() -> Result<()> {
    println!("═══════════════════════════════════════════════════════════");
    println!("   lance-storage-engine 演示                               ");
    println!("═══════════════════════════════════════════════════════════\n");

    let dir = std::env::temp_dir().join("lance-storage-engine-demo");
    let _ = std::fs::remove_dir_all(&dir);
    let mut rng = StdRng::seed_from_u64(2024);

    // =========================================================================
    // 1. 创建数据集
    // =========================================================================
    println!("【1】创建数据集 {} ...", dir.display());
    let params = WriteParams::default().with_max_rows_per_file(2000).with_author("demo");
    let mut ds = Dataset::write(&dir, &[products(0..5000, &mut rng)?], &params)?;
    println!("    v{}: {} fragments, {} rows\n", ds.version(), ds.fragments().len(), ds.count_rows(None)?);

    // =========================================================================
    // 2. 追加与删除
    // =========================================================================
    println!("【2】追加 1000 行，删除价格低于 8 的行 ...");
    ds.append(&[products(5000..6000, &mut rng)?], &params)?;
    let removed = ds.delete(&Predicate::lt("price", 8.0))?;
    println!("    删除 {removed} 行，当前 v{}，{} 行", ds.version(), ds.count_rows(None)?);
    let v1 = ds.checkout_version(1)?;
    println!("    快照 v1 仍有 {} 行\n", v1.count_rows(None)?);

    // =========================================================================
    // 3. 建索引
    // =========================================================================
    println!("【3】建索引 ...");
    ds.create_index("id", None, &IndexParams::BTree)?;
    ds.create_index("title", None, &IndexParams::Inverted)?;
    let ivf = VectorIndexParams::ivf_pq(16, 4, MetricType::L2);
    let meta = ds.create_index("embedding", None, &IndexParams::Vector(ivf))?;
    println!("    {} 个索引；向量索引 `{}` 构建于 v{}\n", ds.indices().len(), meta.name, meta.dataset_version);

    // =========================================================================
    // 4. 查询
    // =========================================================================
    println!("【4】过滤扫描 ...");
    let filter = Predicate::text_match("title", "wooden lamp").and(Predicate::between("id", 100i64, 300i64));
    let scan = ds.scan().project(&["id", "title"]).filter(filter);
    print!("{}", scan.plan()?.explain());
    print_ids("命中", &scan.try_into_batch()?);

    println!("\n    追加新数据后索引过期，新 fragment 走平扫 ...");
    ds.append(&[products(6000..6200, &mut rng)?], &params)?;
    let probe = ds.take(&[lance_storage_engine::row_address(ds.fragments().last().map(|f| f.id).unwrap_or(0), 7)], &["embedding"])?;
    let (_, query) = probe.column(0).vector_values()?;
    let knn = ds.scan().project(&["id"]).nearest("embedding", &query, 5).nprobes(4).refine_factor(5);
    print!("{}", knn.plan()?.explain());
    let hits = knn.try_into_batch()?;
    print_ids("最近邻", &hits);
    if let Some(d) = hits.column_by_name(DISTANCE) {
        println!("    距离: {:?}\n", d.to_values());
    }

    // =========================================================================
    // 5. Schema 演进
    // =========================================================================
    println!("【5】Schema 演进 ...");
    ds.add_columns(
        vec![Field::new("price_with_tax", DataType::Float64, true)],
        &["price"],
        |batch| {
            let taxed: Vec<Value> = batch.column(0).to_values().into_iter()
                .map(|v| match v { Value::Float64(p) => Value::Float64(p * 1.2), other => other })
                .collect();
            Ok(vec![Array::from_values(&DataType::Float64, &taxed)?])
        },
        &params,
    )?;
    ds.rename_column("title", "name")?;
    ds.drop_columns(&["price"])?;
    println!("    v{} 列: {:?}\n", ds.version(), ds.schema().field_names());

    // =========================================================================
    // 6. 维护
    // =========================================================================
    println!("【6】Compaction / 恢复 / 清理 ...");
    let metrics = ds.compact_files(&CompactionOptions::default().with_target_rows_per_fragment(3000), &params)?;
    println!("    compaction: {} → {} fragments", metrics.fragments_removed, metrics.fragments_added);
    for v in ds.versions()? {
        println!("    v{:<3} {:<12} author={:?}", v.version, v.operation.to_string(), v.author);
    }
    let mut old = ds.checkout_version(2)?;
    let restored = old.restore()?;
    println!("    v2 恢复为 v{restored}（{} 行）", old.count_rows(None)?);
    let stats = old.cleanup_old_versions(restored)?;
    println!("    清理: {} 个版本, {} 个文件\n", stats.versions_removed, stats.files_removed);

    println!("完成。");
    Ok(())
}
