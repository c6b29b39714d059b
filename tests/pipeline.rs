use rand::rngs::StdRng;
use rand::SeedableRng;
use readclass::aggregate::Replicates;
use readclass::labels::{LabelIndex, NameTable};
use readclass::profile::ProfileThresholds;
use readclass::record::{open_record_files, BatchReader, PadLength};
use readclass::tokenizer::{encode, Encoding, HeaderConvention};
use readclass::types::{BatchReads, ReadPayload, Record};
use readclass::vocab::{IdBase, Vocabulary};
use readclass::{
    aggregate_predictions, count_predictions, encode_paired, encode_reads, label_fasta,
    label_fasta_map, profile_predictions, trim_reads, PipelineConfig, PredictMode, RecordMode,
};
use std::fs;
use std::path::Path;
use std::sync::Arc;

fn small_vocab() -> Arc<Vocabulary> {
    Arc::new(Vocabulary::from_tokens(["AAA", "AAC", "<unk>"], 3, IdBase::Zero).unwrap())
}

fn read_records(path: &Path, encoding: Encoding) -> Vec<Record> {
    open_record_files(&[path], encoding)
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
}

fn tokens(records: &[Record]) -> Vec<Vec<u32>> {
    records
        .iter()
        .map(|r| match &r.read {
            ReadPayload::Tokens(t) => t.clone(),
            other => panic!("unexpected payload {other:?}"),
        })
        .collect()
}

#[test]
fn test_single_kmer_read_end_to_end() {
    let vocab = Vocabulary::from_tokens(["AAAAAAAAAAAA", "<unk>"], 12, IdBase::Zero).unwrap();
    assert_eq!(encode(b"AAAAAAAAAAAAT", &vocab).unwrap(), vec![0, 1]);
    assert!(encode(b"", &vocab).unwrap().is_empty());
    assert!(encode(b"AC", &vocab).unwrap().is_empty());
}

#[test]
fn test_encode_training_reads_with_both_strands() {
    let dir = tempfile::tempdir().unwrap();
    let fasta = dir.path().join("reads.fa");
    fs::write(&fasta, ">seq1|562|a\nAAAC\n>seq2|1280|b\nccc\n").unwrap();
    let out = dir.path().join("train.rec");

    let labels = LabelIndex::from_pairs([(0, 562), (1, 1280)]).unwrap();
    let encoding = Encoding::kmer(small_vocab());
    let mode = RecordMode::Training {
        labels: &labels,
        header: HeaderConvention::KMER,
    };
    let summary = encode_reads(&fasta, &out, &encoding, mode, true).unwrap();
    assert_eq!(summary.fragments, 2);
    assert_eq!(summary.records, 4);

    let records = read_records(&out, encoding);
    assert_eq!(tokens(&records), vec![vec![0, 1], vec![1, 0], vec![2], vec![2]]);
    let record_labels: Vec<Option<i64>> = records.iter().map(|r| r.label).collect();
    assert_eq!(record_labels, vec![Some(0), Some(0), Some(1), Some(1)]);
}

#[test]
fn test_encode_rejects_unknown_taxon_without_output() {
    let dir = tempfile::tempdir().unwrap();
    let fasta = dir.path().join("reads.fa");
    fs::write(&fasta, ">seq1|999|a\nAAAC\n").unwrap();
    let out = dir.path().join("train.rec");

    let labels = LabelIndex::from_pairs([(0, 562)]).unwrap();
    let mode = RecordMode::Training {
        labels: &labels,
        header: HeaderConvention::KMER,
    };
    let result = encode_reads(&fasta, &out, &Encoding::kmer(small_vocab()), mode, false);
    assert!(result.is_err());
    assert!(!out.exists());
}

#[test]
fn test_encode_rejects_invalid_base() {
    let dir = tempfile::tempdir().unwrap();
    let fasta = dir.path().join("reads.fa");
    fs::write(&fasta, ">ok\nAAAC\n>bad\nAAZC\n").unwrap();
    let out = dir.path().join("predict.rec");

    let err = encode_reads(&fasta, &out, &Encoding::one_hot(), RecordMode::Predict, false)
        .unwrap_err();
    assert!(err.to_string().contains("bad"));
    assert!(!out.exists());
}

#[test]
fn test_encode_paired_order_and_batches() {
    let dir = tempfile::tempdir().unwrap();
    let r1 = dir.path().join("r1.fq");
    let r2 = dir.path().join("r2.fq");
    fs::write(&r1, "@p1/1\nAAAC\n+\nIIII\n").unwrap();
    fs::write(&r2, "@p1/2\nAAAA\n+\nIIII\n").unwrap();
    let out = dir.path().join("paired.rec");

    let encoding = Encoding::kmer(small_vocab());
    let summary = encode_paired(&r1, &r2, &out, &encoding, RecordMode::Predict, true).unwrap();
    assert_eq!(summary.fragments, 1);

    let records = read_records(&out, encoding.clone());
    // r1, rc(r1), r2, rc(r2)
    assert_eq!(
        tokens(&records),
        vec![vec![0, 1], vec![1, 0], vec![0, 0], vec![0, 0]]
    );
    assert!(records.iter().all(|r| r.label.is_none()));

    let batches: Vec<_> = BatchReader::new(
        open_record_files(&[&out], encoding).unwrap(),
        4,
        PadLength::Fixed(3),
    )
    .collect::<Result<Vec<_>, _>>()
    .unwrap();
    assert_eq!(batches.len(), 1);
    match &batches[0].reads {
        BatchReads::Tokens(array) => assert_eq!(array.row(0).to_vec(), vec![0, 1, 0]),
        other => panic!("unexpected batch {other:?}"),
    }

    fs::write(&r2, "").unwrap();
    let err = encode_paired(&r1, &r2, &out, &Encoding::kmer(small_vocab()), RecordMode::Predict, true);
    assert!(err.is_err());
}

#[test]
fn test_predict_then_profile() {
    let dir = tempfile::tempdir().unwrap();
    let matrix = dir.path().join("probs.txt");
    fs::write(
        &matrix,
        "0.9 0.05 0.05\n0.7 0.2 0.1\n0.1 0.6 0.3\n0.1 0.8 0.1\n",
    )
    .unwrap();
    let prefix = dir.path().join("sample");
    let labels = LabelIndex::from_pairs([(0, 562), (1, 1280), (2, 1423)]).unwrap();
    let config = PipelineConfig {
        num_classes: Some(3),
        batch_size: 2,
        ..Default::default()
    };

    let reads =
        aggregate_predictions(&matrix, &prefix, &config, PredictMode::SingleClass, Some(&labels))
            .unwrap();
    assert_eq!(reads, 2);
    assert_eq!(
        fs::read_to_string(dir.path().join("sample.category_single.txt")).unwrap(),
        "562\n1280\n"
    );
    assert_eq!(
        fs::read_to_string(dir.path().join("sample.prob_single.txt")).unwrap(),
        "80.00\n70.00\n"
    );

    let report = dir.path().join("profile.txt");
    let names = NameTable::from_pairs([("562", "Escherichia coli"), ("1280", "Staphylococcus aureus")]);
    let taxa = profile_predictions(
        &dir.path().join("sample.prediction.txt"),
        &report,
        &names,
        ProfileThresholds::default(),
    )
    .unwrap();
    assert_eq!(taxa, 2);
    assert_eq!(
        fs::read_to_string(&report).unwrap(),
        "Name\tCount\tConfidence\nEscherichia coli\t1\t80.0\nStaphylococcus aureus\t1\t70.0\n"
    );

    let counts = dir.path().join("counts.txt");
    assert_eq!(
        count_predictions(&dir.path().join("sample.category_single.txt"), &counts, &names).unwrap(),
        2
    );
    assert_eq!(
        fs::read_to_string(&counts).unwrap(),
        "Escherichia coli\t1\nStaphylococcus aureus\t1\n"
    );
}

#[test]
fn test_predict_top_n_and_ragged_matrix() {
    let dir = tempfile::tempdir().unwrap();
    let matrix = dir.path().join("probs.txt");
    fs::write(&matrix, "0.1 0.5 0.4\n0.2 0.2 0.6\n").unwrap();
    let prefix = dir.path().join("top");
    let config = PipelineConfig {
        num_classes: Some(3),
        replicates: Replicates::Single,
        ..Default::default()
    };

    aggregate_predictions(&matrix, &prefix, &config, PredictMode::TopN(2), None).unwrap();
    assert_eq!(
        fs::read_to_string(dir.path().join("top.category.txt")).unwrap(),
        "1\t2\n2\t0\n"
    );
    assert_eq!(
        fs::read_to_string(dir.path().join("top.prob.txt")).unwrap(),
        "50.00\t40.00\n60.00\t20.00\n"
    );

    let paired = PipelineConfig {
        replicates: Replicates::PairedEnd,
        ..config
    };
    let err = aggregate_predictions(&matrix, &prefix, &paired, PredictMode::Prob, None);
    assert!(err.is_err());
    assert!(!dir.path().join("top.probability.txt").exists());
}

#[test]
fn test_paired_class_averages_both_mates() {
    let dir = tempfile::tempdir().unwrap();
    let matrix = dir.path().join("probs.txt");
    // r1, rc(r1), r2, rc(r2) of a single pair.
    fs::write(
        &matrix,
        "0.9 0.05 0.05\n0.7 0.2 0.1\n0.8 0.1 0.1\n0.6 0.3 0.1\n",
    )
    .unwrap();
    let prefix = dir.path().join("pairs");
    // Default layout is double-strand and top_n exceeds the class count.
    let config = PipelineConfig {
        num_classes: Some(3),
        top_n: 5,
        ..Default::default()
    };

    let reads =
        aggregate_predictions(&matrix, &prefix, &config, PredictMode::PairedClass, None).unwrap();
    assert_eq!(reads, 1);
    assert_eq!(
        fs::read_to_string(dir.path().join("pairs.category_paired.txt")).unwrap(),
        "0\n"
    );
    assert_eq!(
        fs::read_to_string(dir.path().join("pairs.prob_paired.txt")).unwrap(),
        "75.00\n"
    );
    assert_eq!(
        fs::read_to_string(dir.path().join("pairs.prediction.txt")).unwrap(),
        "0\t75.00\n"
    );

    let forward_only = PipelineConfig {
        strands_average: false,
        ..config
    };
    let reads = aggregate_predictions(&matrix, &prefix, &forward_only, PredictMode::PairedClass, None)
        .unwrap();
    assert_eq!(reads, 2);
}

#[test]
fn test_label_fasta_feeds_training_header() {
    let dir = tempfile::tempdir().unwrap();
    let genome = dir.path().join("genome.fna");
    fs::write(&genome, ">NC_000913.3 Escherichia coli\nAAAC\n").unwrap();
    let labelled = dir.path().join("labelled.fna");
    assert_eq!(label_fasta(&genome, &labelled, 562).unwrap(), 1);

    let labels = LabelIndex::from_pairs([(0, 562)]).unwrap();
    let out = dir.path().join("train.rec");
    let mode = RecordMode::Training {
        labels: &labels,
        header: HeaderConvention::KMER,
    };
    encode_reads(&labelled, &out, &Encoding::kmer(small_vocab()), mode, false).unwrap();
    let records = read_records(&out, Encoding::kmer(small_vocab()));
    assert_eq!(records[0].label, Some(0));
}

#[test]
fn test_label_fasta_map_labels_every_genome() {
    let dir = tempfile::tempdir().unwrap();
    let ecoli = dir.path().join("ecoli.fna");
    let staph = dir.path().join("staph.fna");
    fs::write(&ecoli, ">NC_000913.3 Escherichia coli\nAAAC\n").unwrap();
    fs::write(&staph, ">NC_007795.1\nCCCA\n>plasmid\nGG\n").unwrap();
    let map = dir.path().join("map.txt");
    fs::write(
        &map,
        format!("{}\t562\n{}\t1280\n\n", ecoli.display(), staph.display()),
    )
    .unwrap();
    let out_dir = dir.path().join("labelled");
    fs::create_dir(&out_dir).unwrap();

    let outputs = label_fasta_map(&map, &out_dir).unwrap();
    assert_eq!(outputs, vec![out_dir.join("label_ecoli.fna"), out_dir.join("label_staph.fna")]);
    assert_eq!(
        fs::read_to_string(&outputs[1]).unwrap(),
        ">label|1280|NC_007795.1\nCCCA\n>label|1280|plasmid\nGG\n"
    );

    fs::write(&map, format!("{}\tecoli\n", ecoli.display())).unwrap();
    assert!(label_fasta_map(&map, &out_dir).is_err());
}

#[test]
fn test_trim_reads_writes_shorter_fasta() {
    let dir = tempfile::tempdir().unwrap();
    let fastq = dir.path().join("reads.fq");
    fs::write(&fastq, "@r1 desc\nACGTACGTAC\n+\nIIIIIIIIII\n@r2\nGGGGGG\n+\nIIIIII\n").unwrap();
    let out = dir.path().join("trimmed.fa");

    let mut rng = StdRng::seed_from_u64(42);
    assert_eq!(trim_reads(&fastq, &out, 2..=4, &mut rng).unwrap(), 2);
    let text = fs::read_to_string(&out).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines[0], ">r1");
    assert!((6..=8).contains(&lines[1].len()));
    assert_eq!(lines[2], ">r2");
    assert!((2..=4).contains(&lines[3].len()));
}
