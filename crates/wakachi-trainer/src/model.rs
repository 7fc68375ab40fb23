//! Character-level encoder-decoder with attention.
//!
//! The encoder and decoder are stacked LSTMs sharing one embedding table.
//! The decoder attends over the encoder outputs at every step and projects
//! the attended state onto the vocabulary.

use candle_core::{D, Device, IndexOp, Module, Result, Tensor};
use candle_nn::rnn::{LSTM, LSTMConfig, LSTMState, RNN, lstm};
use candle_nn::{Embedding, Linear, VarBuilder, embedding, linear, linear_no_bias, ops};
use wakachi_core::vocab::{EOS_ID, PAD_ID, SOS_ID};
use wakachi_core::{AttentionType, Enc2Dec, ModelConfig};

/// Additive mask value for padded source positions.
const MASKED: f32 = -1e9;

/// How the decoder state is compared to each encoder output.
enum Scorer {
    Dot,
    Bilinear(Linear),
    Additive { keys: Linear, query: Linear, v: Linear },
    Deep(Linear, Linear),
}

struct Attention {
    scorer: Scorer,
    linear_out: Linear,
}

impl Attention {
    fn new(kind: AttentionType, hidden: usize, vb: VarBuilder) -> Result<Self> {
        let scorer = match kind {
            AttentionType::Soft => Scorer::Dot,
            AttentionType::Linear => Scorer::Bilinear(linear_no_bias(hidden, hidden, vb.pp("linear_in"))?),
            AttentionType::Mlp => Scorer::Additive {
                keys: linear_no_bias(hidden, hidden, vb.pp("linear_context"))?,
                query: linear(hidden, hidden, vb.pp("linear_query"))?,
                v: linear_no_bias(hidden, 1, vb.pp("v"))?,
            },
            AttentionType::Deep => Scorer::Deep(
                linear(hidden, hidden, vb.pp("linear_in_0"))?,
                linear(hidden, hidden, vb.pp("linear_in_1"))?,
            ),
        };
        let linear_out = linear_no_bias(2 * hidden, hidden, vb.pp("linear_out"))?;
        Ok(Self { scorer, linear_out })
    }

    /// `query`: (batch, hidden), `context`: (batch, src, hidden),
    /// `mask`: (batch, src) additive. Returns (batch, hidden).
    fn forward(&self, query: &Tensor, context: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let dot = |q: &Tensor| context.matmul(&q.unsqueeze(2)?)?.squeeze(2);
        let scores = match &self.scorer {
            Scorer::Dot => dot(query)?,
            Scorer::Bilinear(w) => dot(&w.forward(query)?)?,
            Scorer::Deep(w0, w1) => dot(&w1.forward(&w0.forward(query)?.tanh()?)?.tanh()?)?,
            Scorer::Additive { keys, query: wq, v } => {
                let q = wq.forward(query)?.unsqueeze(1)?;
                let e = keys.forward(context)?.broadcast_add(&q)?.tanh()?;
                v.forward(&e)?.squeeze(2)?
            }
        };
        let weights = ops::softmax(&scores.add(mask)?, D::Minus1)?;
        let attended = weights.unsqueeze(1)?.matmul(context)?.squeeze(1)?;
        self.linear_out
            .forward(&Tensor::cat(&[&attended, query], 1)?)?
            .tanh()
    }
}

/// Encoder outputs carried through decoding.
pub struct Encoded {
    /// Top-layer outputs, (batch, src, hidden).
    pub outputs: Tensor,
    /// Additive padding mask, (batch, src).
    pub mask: Tensor,
    /// Initial decoder state per layer.
    pub states: Vec<LSTMState>,
}

/// Teacher-forcing tensors for one training batch.
pub struct Padded {
    /// Source ids, (batch, src).
    pub src: Tensor,
    /// Unpadded source lengths, each at least 1.
    pub src_lens: Vec<usize>,
    /// `<SOS>` + target, (batch, tgt).
    pub tgt_in: Tensor,
    /// Target + `<EOS>`, (batch, tgt).
    pub tgt_out: Tensor,
    /// 1.0 where `tgt_out` is not padding, flattened to (batch * tgt).
    pub tgt_mask: Tensor,
}

impl Padded {
    /// Pad a training batch. Targets longer than `max_len - 1` are cut so
    /// that the decoder never runs past `max_len` steps.
    pub fn new(src: &[Vec<u32>], tgt: &[Vec<u32>], max_len: usize, device: &Device) -> Result<Self> {
        let (src, src_lens) = pad_sources(src, device)?;

        let rows: Vec<&[u32]> = tgt
            .iter()
            .map(|t| &t[..t.len().min(max_len.saturating_sub(1))])
            .collect();
        let width = rows.iter().map(|r| r.len()).max().unwrap_or(0) + 1;
        let mut tgt_in = Vec::with_capacity(rows.len() * width);
        let mut tgt_out = Vec::with_capacity(rows.len() * width);
        for row in &rows {
            tgt_in.push(SOS_ID);
            tgt_in.extend_from_slice(row);
            tgt_out.extend_from_slice(row);
            tgt_out.push(EOS_ID);
            let pad = width - row.len() - 1;
            tgt_in.extend(std::iter::repeat_n(PAD_ID, pad));
            tgt_out.extend(std::iter::repeat_n(PAD_ID, pad));
        }
        let mask: Vec<f32> = tgt_out.iter().map(|&id| (id != PAD_ID) as u8 as f32).collect();

        let shape = (rows.len(), width);
        Ok(Self {
            src,
            src_lens,
            tgt_in: Tensor::from_vec(tgt_in, shape, device)?,
            tgt_out: Tensor::from_vec(tgt_out, shape, device)?,
            tgt_mask: Tensor::from_vec(mask, rows.len() * width, device)?,
        })
    }
}

/// Right-pad sources with `<PAD>`. Empty sources count as one pad step.
pub fn pad_sources(src: &[Vec<u32>], device: &Device) -> Result<(Tensor, Vec<usize>)> {
    let lens: Vec<usize> = src.iter().map(|s| s.len().max(1)).collect();
    let width = lens.iter().copied().max().unwrap_or(1);
    let mut flat = Vec::with_capacity(src.len() * width);
    for row in src {
        flat.extend_from_slice(row);
        flat.extend(std::iter::repeat_n(PAD_ID, width - row.len()));
    }
    Ok((Tensor::from_vec(flat, (src.len(), width), device)?, lens))
}

fn padding_mask(lens: &[usize], width: usize, device: &Device) -> Result<Tensor> {
    let flat: Vec<f32> = lens
        .iter()
        .flat_map(|&l| (0..width).map(move |i| if i < l { 0.0 } else { MASKED }))
        .collect();
    Tensor::from_vec(flat, (lens.len(), width), device)
}

fn dropout(xs: &Tensor, p: f32, train: bool) -> Result<Tensor> {
    if train && p > 0.0 {
        ops::dropout(xs, p)
    } else {
        Ok(xs.clone())
    }
}

fn stacked_lstm(input: usize, hidden: usize, layers: usize, vb: VarBuilder) -> Result<Vec<LSTM>> {
    (0..layers)
        .map(|layer| {
            let cfg = LSTMConfig {
                layer_idx: layer,
                ..Default::default()
            };
            lstm(if layer == 0 { input } else { hidden }, hidden, cfg, vb.clone())
        })
        .collect()
}

/// State at position `len - 1` of every example.
fn final_state(states: &[LSTMState], lens: &[usize]) -> Result<LSTMState> {
    let mut hs = Vec::with_capacity(lens.len());
    let mut cs = Vec::with_capacity(lens.len());
    for (i, &len) in lens.iter().enumerate() {
        let s = &states[len - 1];
        hs.push(s.h().narrow(0, i, 1)?);
        cs.push(s.c().narrow(0, i, 1)?);
    }
    Ok(LSTMState::new(Tensor::cat(&hs, 0)?, Tensor::cat(&cs, 0)?))
}

pub struct Seq2SeqModel {
    embedding: Embedding,
    encoder: Vec<LSTM>,
    decoder: Vec<LSTM>,
    attention: Attention,
    bridge: Option<Linear>,
    projection: Linear,
    config: ModelConfig,
    vocab_size: usize,
}

impl Seq2SeqModel {
    pub fn new(config: &ModelConfig, vocab_size: usize, vb: VarBuilder) -> Result<Self> {
        let (h, e) = (config.hidden_dim, config.emb_dim);
        let bridge = match config.enc2dec {
            Enc2Dec::Linear | Enc2Dec::Nonlinear => Some(linear(h, h, vb.pp("enc2dec"))?),
            Enc2Dec::No | Enc2Dec::Zero => None,
        };
        Ok(Self {
            embedding: embedding(vocab_size, e, vb.pp("embedding"))?,
            encoder: stacked_lstm(e, h, config.num_layers, vb.pp("encoder"))?,
            decoder: stacked_lstm(e, h, config.num_layers, vb.pp("decoder"))?,
            attention: Attention::new(config.attn_type, h, vb.pp("attn"))?,
            bridge,
            projection: linear(h, vocab_size, vb.pp("projection"))?,
            config: config.clone(),
            vocab_size,
        })
    }

    /// Run the encoder over padded `src` (batch, src).
    pub fn encode(&self, src: &Tensor, lens: &[usize], train: bool) -> Result<Encoded> {
        let (_, width) = src.dims2()?;
        let mut x = dropout(&self.embedding.forward(src)?, self.config.emb_dropout, train)?;
        let mut finals = Vec::with_capacity(self.encoder.len());
        for (layer, lstm) in self.encoder.iter().enumerate() {
            if layer > 0 {
                x = dropout(&x, self.config.dropout, train)?;
            }
            let states = lstm.seq(&x)?;
            finals.push(final_state(&states, lens)?);
            x = lstm.states_to_tensor(&states)?;
        }
        let states = finals
            .into_iter()
            .map(|s| self.bridge_state(s))
            .collect::<Result<Vec<_>>>()?;
        Ok(Encoded {
            outputs: x,
            mask: padding_mask(lens, width, src.device())?,
            states,
        })
    }

    fn bridge_state(&self, state: LSTMState) -> Result<LSTMState> {
        match (self.config.enc2dec, &self.bridge) {
            (Enc2Dec::Zero, _) => Ok(LSTMState::new(state.h().zeros_like()?, state.c().zeros_like()?)),
            (Enc2Dec::Linear, Some(w)) => Ok(LSTMState::new(w.forward(state.h())?, state.c().clone())),
            (Enc2Dec::Nonlinear, Some(w)) => {
                Ok(LSTMState::new(w.forward(state.h())?.tanh()?, state.c().clone()))
            }
            _ => Ok(state),
        }
    }

    /// One decoder step. `prev`: (batch,) ids. Returns logits (batch, vocab)
    /// and the next per-layer states.
    pub fn decode_step(
        &self,
        prev: &Tensor,
        states: &[LSTMState],
        enc: &Encoded,
        train: bool,
    ) -> Result<(Tensor, Vec<LSTMState>)> {
        let mut x = dropout(&self.embedding.forward(prev)?, self.config.emb_dropout, train)?;
        let mut next = Vec::with_capacity(states.len());
        for (lstm, state) in self.decoder.iter().zip(states) {
            let s = lstm.step(&x, state)?;
            x = dropout(s.h(), self.config.dropout, train)?;
            next.push(s);
        }
        let attended = self.attention.forward(&x, &enc.outputs, &enc.mask)?;
        let attended = dropout(&attended, self.config.dropout, train)?;
        Ok((self.projection.forward(&attended)?, next))
    }

    /// Mean cross entropy over non-padding target positions.
    pub fn loss(&self, batch: &Padded, train: bool) -> Result<Tensor> {
        let enc = self.encode(&batch.src, &batch.src_lens, train)?;
        let (b, t) = batch.tgt_in.dims2()?;
        let mut states = enc.states.clone();
        let mut logits = Vec::with_capacity(t);
        for i in 0..t {
            let prev = batch.tgt_in.i((.., i))?.contiguous()?;
            let (step, next) = self.decode_step(&prev, &states, &enc, train)?;
            logits.push(step);
            states = next;
        }
        let logits = Tensor::stack(&logits, 1)?.reshape((b * t, self.vocab_size))?;
        let log_probs = ops::log_softmax(&logits, D::Minus1)?;
        let gold = batch.tgt_out.reshape((b * t, 1))?;
        let picked = log_probs.gather(&gold, 1)?.squeeze(1)?;
        picked
            .mul(&batch.tgt_mask)?
            .sum_all()?
            .neg()?
            .div(&batch.tgt_mask.sum_all()?)
    }

    /// Decode one source with beam search. Width 1 is greedy decoding.
    /// `<PAD>` and `<SOS>` are never emitted. Returns ids without `<EOS>`.
    pub fn beam_search(&self, src: &[u32], beam_size: usize, max_len: usize) -> Result<Vec<u32>> {
        let device = self.embedding.embeddings().device().clone();
        let (src, lens) = pad_sources(&[src.to_vec()], &device)?;
        let enc = self.encode(&src, &lens, false)?;
        let beam_size = beam_size.max(1);

        let mut beams = vec![Hypothesis {
            ids: Vec::new(),
            score: 0.0,
            states: enc.states.clone(),
        }];
        let mut finished: Vec<(Vec<u32>, f32)> = Vec::new();

        for _ in 0..max_len {
            let mut expansions: Vec<(f32, usize, u32)> = Vec::new();
            let mut next_states = Vec::with_capacity(beams.len());
            for (b, hyp) in beams.iter().enumerate() {
                let prev = Tensor::new(&[hyp.ids.last().copied().unwrap_or(SOS_ID)], &device)?;
                let (logits, states) = self.decode_step(&prev, &hyp.states, &enc, false)?;
                let log_probs = ops::log_softmax(&logits, D::Minus1)?.squeeze(0)?.to_vec1::<f32>()?;
                for (id, lp) in log_probs.into_iter().enumerate() {
                    let id = id as u32;
                    if id != PAD_ID && id != SOS_ID {
                        expansions.push((hyp.score + lp, b, id));
                    }
                }
                next_states.push(states);
            }
            // Highest score first; ties go to the older beam, then the lower id.
            expansions.sort_by(|x, y| y.0.total_cmp(&x.0).then(x.1.cmp(&y.1)).then(x.2.cmp(&y.2)));

            let mut next = Vec::with_capacity(beam_size);
            for (score, b, id) in expansions.into_iter().take(beam_size) {
                let mut ids = beams[b].ids.clone();
                if id == EOS_ID {
                    finished.push((ids, score));
                } else {
                    ids.push(id);
                    next.push(Hypothesis {
                        ids,
                        score,
                        states: next_states[b].clone(),
                    });
                }
            }
            beams = next;
            if beams.is_empty() || finished.len() >= beam_size {
                break;
            }
        }

        let mut best: Option<(Vec<u32>, f32)> = None;
        let unfinished = beams.into_iter().map(|h| (h.ids, h.score));
        for (ids, score) in finished.into_iter().chain(unfinished) {
            if best.as_ref().is_none_or(|(_, s)| score > *s) {
                best = Some((ids, score));
            }
        }
        Ok(best.map(|(ids, _)| ids).unwrap_or_default())
    }
}

struct Hypothesis {
    ids: Vec<u32>,
    score: f32,
    states: Vec<LSTMState>,
}
