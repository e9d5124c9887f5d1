//! Merging postings of several segments into one consumer.
//!
//! Terms of every input are visited in a single sorted pass; documents are
//! renumbered through the merge's doc maps and deleted documents dropped.
//! What gets copied per document follows the merged field's index options:
//! a field merged down to fewer options than an input had simply stops
//! reading the extra data.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use bit_vec::BitVec;

use crate::codec::field_infos::{FieldInfo, IndexOptions};
use crate::codec::postings::{FieldsConsumer, NO_MORE_DOCS, TermStats, TermsConsumer, TermsEnum};
use crate::error::{QuiverError, Result};
use crate::index::merge_state::{MergeCursor, MergeState};

/// Merge every indexed field of the inputs, in merged field number order.
pub fn merge_fields<C: FieldsConsumer + ?Sized>(
    consumer: &mut C,
    state: &MergeState,
    cursor: &mut MergeCursor,
) -> Result<()> {
    for field in state.field_infos.iter() {
        if !field.is_indexed() {
            continue;
        }

        let mut subs = Vec::new();
        for (reader_index, reader) in state.readers.iter().enumerate() {
            let Some(producer) = reader.fields() else {
                continue;
            };
            if let Some(terms) = producer.terms(&field.name)? {
                subs.push(TermsEnumWithSlice {
                    reader_index,
                    terms: terms.iterator()?,
                });
            }
        }
        if subs.is_empty() {
            continue;
        }

        cursor.current_field = Some(field.clone());
        let terms_consumer = consumer.add_field(field)?;
        merge_terms(terms_consumer, field, subs, state, cursor)?;
    }

    cursor.current_field = None;
    Ok(())
}

/// A sub-enum tagged with the reader it came from.
struct TermsEnumWithSlice {
    reader_index: usize,
    terms: Box<dyn TermsEnum>,
}

/// Sorted union of several terms enums.
///
/// After [`next`](Self::next), `matches` lists the subs positioned on the
/// current term in reader order.
struct MultiTermsEnum {
    subs: Vec<TermsEnumWithSlice>,
    queue: BinaryHeap<Reverse<(Vec<u8>, usize)>>,
    matches: Vec<usize>,
}

impl MultiTermsEnum {
    fn new(mut subs: Vec<TermsEnumWithSlice>) -> Result<Self> {
        let mut queue = BinaryHeap::with_capacity(subs.len());
        for (index, sub) in subs.iter_mut().enumerate() {
            if let Some(term) = sub.terms.next()? {
                queue.push(Reverse((term.to_vec(), index)));
            }
        }
        Ok(MultiTermsEnum {
            subs,
            queue,
            matches: Vec::new(),
        })
    }

    fn next(&mut self) -> Result<Option<Vec<u8>>> {
        for index in std::mem::take(&mut self.matches) {
            if let Some(term) = self.subs[index].terms.next()? {
                self.queue.push(Reverse((term.to_vec(), index)));
            }
        }

        let Some(Reverse((term, index))) = self.queue.pop() else {
            return Ok(None);
        };
        self.matches.push(index);
        while let Some(Reverse((next, _))) = self.queue.peek() {
            if *next != term {
                break;
            }
            if let Some(Reverse((_, index))) = self.queue.pop() {
                self.matches.push(index);
            }
        }
        self.matches
            .sort_unstable_by_key(|&index| self.subs[index].reader_index);
        Ok(Some(term))
    }
}

fn merge_terms(
    consumer: &mut dyn TermsConsumer,
    field: &FieldInfo,
    subs: Vec<TermsEnumWithSlice>,
    state: &MergeState,
    cursor: &mut MergeCursor,
) -> Result<()> {
    let options = field.index_options.ok_or_else(|| {
        QuiverError::invalid_operation(format!("field {} is not indexed", field.name))
    })?;
    let store_payloads = field.has_payloads();

    let mut terms = MultiTermsEnum::new(subs)?;
    let mut visited = BitVec::from_elem(state.segment_info.doc_count as usize, false);
    let mut sum_total_term_freq = 0i64;
    let mut sum_doc_freq = 0i64;

    while let Some(term) = terms.next()? {
        let postings_consumer = consumer.start_term(&term)?;
        let mut doc_freq = 0u32;
        let mut total_term_freq = 0i64;

        for i in 0..terms.matches.len() {
            let sub = &mut terms.subs[terms.matches[i]];
            let doc_map = &state.doc_maps[sub.reader_index];
            let mut postings = sub.terms.postings()?;

            loop {
                let doc = postings.next_doc()?;
                if doc == NO_MORE_DOCS {
                    break;
                }
                let Some(merged_doc) = doc_map.get(doc) else {
                    continue;
                };

                visited.set(merged_doc as usize, true);
                doc_freq += 1;

                match options {
                    IndexOptions::DocsOnly => {
                        postings_consumer.start_doc(merged_doc, -1)?;
                    }
                    IndexOptions::DocsAndFreqs => {
                        let freq = postings.freq();
                        postings_consumer.start_doc(merged_doc, freq as i32)?;
                        total_term_freq += freq as i64;
                    }
                    IndexOptions::DocsAndFreqsAndPositions => {
                        let freq = postings.freq();
                        postings_consumer.start_doc(merged_doc, freq as i32)?;
                        total_term_freq += freq as i64;
                        for _ in 0..freq {
                            let position = postings.next_position()?;
                            let payload = if store_payloads {
                                postings.payload()
                            } else {
                                None
                            };
                            postings_consumer.add_position(position, payload, -1, -1)?;
                        }
                    }
                    IndexOptions::DocsAndFreqsAndPositionsAndOffsets => {
                        let freq = postings.freq();
                        postings_consumer.start_doc(merged_doc, freq as i32)?;
                        total_term_freq += freq as i64;
                        for _ in 0..freq {
                            let position = postings.next_position()?;
                            let payload = if store_payloads {
                                postings.payload()
                            } else {
                                None
                            };
                            postings_consumer.add_position(
                                position,
                                payload,
                                postings.start_offset(),
                                postings.end_offset(),
                            )?;
                        }
                    }
                }
                postings_consumer.finish_doc()?;
            }
        }

        if doc_freq > 0 {
            let total_term_freq = if options == IndexOptions::DocsOnly {
                -1
            } else {
                total_term_freq
            };
            consumer.finish_term(
                &term,
                TermStats {
                    doc_freq,
                    total_term_freq,
                },
            )?;
            sum_doc_freq += doc_freq as i64;
            sum_total_term_freq += total_term_freq.max(0);
        }
        cursor.check_abort.work(doc_freq as u64)?;
    }

    let doc_count = visited.iter().filter(|&seen| seen).count() as u32;
    let sum_total_term_freq = if options == IndexOptions::DocsOnly {
        -1
    } else {
        sum_total_term_freq
    };
    consumer.finish(sum_total_term_freq, sum_doc_freq, doc_count)
}
